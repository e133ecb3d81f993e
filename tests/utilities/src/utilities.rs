use chain_txm::chain::{Chain, ChainError, ChainRecord, Node};
use chain_txm::config::{ChainCfg, TxmConfig};
use chain_txm::manager::{Collaborators, Txm};
use ethers::types::{Address, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::filter::EnvFilter;

use crate::mocks::{MockBroadcaster, MockClient, MockLedger, MockSigner, MockTime};

#[macro_export]
macro_rules! assert_ok(
    ($result: expr) => {
        match $result {
            Ok(..) => {},
            Err(err) => panic!("expected Ok, got Err({:?})", err),
        }
    };
);

#[macro_export]
macro_rules! assert_err(
    ($result: expr, $expected: expr) => {
        match $result {
            Ok(..) => panic!("expected Err({:?}), got Ok(..)", $expected),
            Err(err) => assert_eq!(err.to_string(), $expected.to_string()),
        }
    };
);

pub fn setup_tracing() {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .with_level(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_source_location(false)
        .compact();
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .event_format(format)
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub const CHAIN_ID: &str = "1337";

pub struct Account {
    pub address: &'static str,
    pub private_key: &'static str,
}

pub const ACCOUNT1: Account = Account {
    address: "0x63fac9201494f0bd17b9892b9fae4d52fe3bd377",
    private_key: "8da4ef21b864d2cc526dbdb2a120bd2874c36c9d0a1fb7f8c63d7f7a8b41de8f",
};

pub const ACCOUNT2: Account = Account {
    address: "0xf30e6e20be8474393f2f2bbd61a52143d851c19b",
    private_key: "fda4ef21b864d2cc526dbdb2a120bd2874c36c9d0a1fb7f8c63d7f7a8b41de88",
};

pub fn account(account: &Account) -> Address {
    account.address.parse().unwrap()
}

pub fn node(name: &str) -> Node {
    Node {
        name: name.to_string(),
        url: format!("http://{}:8545", name).parse().unwrap(),
        secondary_url: None,
    }
}

pub fn chain_record(id: &str, nodes: Vec<Node>) -> ChainRecord {
    ChainRecord {
        id: id.to_string(),
        cfg: ChainCfg {
            fallback_gas_price: U256::from(10u64),
            gas_limit_multiplier: 1.0,
            gas_limit_transfer: 1,
        },
        nodes,
    }
}

/// Mocked collaborators of a chain. Every mock shares its state with the
/// clones handed to the code under test.
#[derive(Debug, Clone)]
pub struct Harness {
    pub client: MockClient,
    pub ledger: Arc<MockLedger>,
    pub signer: Arc<MockSigner>,
    pub broadcaster: Arc<MockBroadcaster>,
}

impl Harness {
    /// The signer knows ACCOUNT1 and ACCOUNT2.
    pub fn new() -> Harness {
        Harness {
            client: MockClient::new(),
            ledger: Arc::new(MockLedger::new()),
            signer: Arc::new(MockSigner::new(&[account(&ACCOUNT1), account(&ACCOUNT2)])),
            broadcaster: Arc::new(MockBroadcaster::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            ledger: self.ledger.clone(),
            signer: self.signer.clone(),
            broadcaster: self.broadcaster.clone(),
        }
    }

    /// Loops poll once an hour, so tests drive the ticks by hand.
    pub fn txm_config() -> TxmConfig {
        TxmConfig::default()
            .set_poll_interval(Duration::from_secs(3600))
            .set_close_timeout(Duration::from_secs(1))
            .set_time(Arc::new(MockTime::default()))
    }

    pub fn txm(&self) -> Txm<MockClient> {
        self.txm_with(Harness::txm_config())
    }

    pub fn txm_with(&self, config: TxmConfig) -> Txm<MockClient> {
        let record = chain_record(CHAIN_ID, vec![node("primary")]);
        Txm::new(
            CHAIN_ID,
            Arc::new(self.client.clone()),
            self.collaborators(),
            &record.cfg,
            config,
        )
    }

    pub fn chain(&self, id: &str) -> Result<Chain<MockClient>, ChainError> {
        let client = self.client.clone();
        Chain::new(
            chain_record(id, vec![node("primary")]),
            Harness::txm_config(),
            self.collaborators(),
            move |_| Ok(client),
        )
    }
}

impl Default for Harness {
    fn default() -> Self {
        Harness::new()
    }
}
