mod utilities;

pub mod mocks;

pub use utilities::{
    account, chain_record, node, setup_tracing, Account, Harness, ACCOUNT1, ACCOUNT2, CHAIN_ID,
};
