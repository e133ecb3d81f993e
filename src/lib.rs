pub mod balance;
pub mod chain;
pub mod chain_set;
pub mod client;
pub mod config;
pub mod database;
pub mod events;
pub mod gas_estimator;
pub mod health;
pub mod lifecycle;
pub mod manager;
pub mod signer;
pub mod time;
pub mod transaction;
pub mod transfer;

pub use chain::{Chain, ChainError, ChainRecord, Node};
pub use chain_set::{ChainSet, ChainSetError};
pub use client::{ClientError, EthersClient, Finality, NetworkClient, Reader};
pub use config::{ChainCfg, ChainsFile, TxmConfig};
pub use health::MultiError;
pub use lifecycle::{LifecycleError, State};
pub use manager::{Collaborators, MsgEnqueuer, Txm, TxmError};
pub use transaction::{GasQuote, PendingTransaction, TransactionResource, TxStatus};
pub use transfer::{TransferError, TransferRequest, TransferRequestHandler, TransferResponse};
