use ethers::providers::{Http, Provider};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::balance::BalanceMonitor;
use crate::client::{EthersClient, NetworkClient, Reader};
use crate::config::{ChainCfg, TxmConfig};
use crate::health::MultiError;
use crate::lifecycle::{LifecycleError, StartStopOnce, State};
use crate::manager::{Collaborators, MsgEnqueuer, Txm, TxmError};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain {0} has no nodes configured")]
    NoNodes(String),

    #[error("invalid configuration for chain {chain_id}: {reason}")]
    InvalidConfig { chain_id: String, reason: String },

    #[error("chain {chain_id}: could not connect to node {node}: {error:#}")]
    Connect {
        chain_id: String,
        node: String,
        error: anyhow::Error,
    },

    #[error(transparent)]
    Txm(#[from] TxmError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// One network endpoint of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub url: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_url: Option<Url>,
}

/// Persisted description of a chain and its nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub id: String,
    #[serde(default)]
    pub cfg: ChainCfg,
    pub nodes: Vec<Node>,
}

/// Picks the endpoint a chain talks to.
pub trait NodeSelector: Debug + Send + Sync {
    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node>;
}

/// Always the first configured node.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstNode;

impl NodeSelector for FirstNode {
    fn select<'a>(&self, nodes: &'a [Node]) -> Option<&'a Node> {
        nodes.first()
    }
}

/// A network client and its transaction manager under a single lifecycle.
#[derive(Debug)]
pub struct Chain<C> {
    id: String,
    cfg: ChainCfg,
    nodes: Vec<Node>,
    client: Arc<C>,
    txm: Txm<C>,
    balance_monitor: Option<Arc<dyn BalanceMonitor>>,
    once: StartStopOnce,
}

impl Chain<EthersClient<Provider<Http>>> {
    /// Builds a chain talking JSON-RPC over HTTP to its first node.
    pub fn dial(
        record: ChainRecord,
        config: TxmConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ChainError> {
        Chain::new(record, config, collaborators, |node| {
            EthersClient::connect(node).map_err(anyhow::Error::from)
        })
    }
}

impl<C: NetworkClient + 'static> Chain<C> {
    pub fn new<F>(
        record: ChainRecord,
        config: TxmConfig,
        collaborators: Collaborators,
        connect: F,
    ) -> Result<Self, ChainError>
    where
        F: FnOnce(&Node) -> anyhow::Result<C>,
    {
        Chain::with_selector(record, config, collaborators, &FirstNode, connect)
    }

    /// Fails before creating any client or manager when `record` has no
    /// nodes or an invalid gas policy.
    pub fn with_selector<F>(
        record: ChainRecord,
        config: TxmConfig,
        collaborators: Collaborators,
        selector: &dyn NodeSelector,
        connect: F,
    ) -> Result<Self, ChainError>
    where
        F: FnOnce(&Node) -> anyhow::Result<C>,
    {
        let ChainRecord { id, cfg, nodes } = record;

        if nodes.is_empty() {
            return Err(ChainError::NoNodes(id));
        }
        cfg.validate(&id).map_err(|err| ChainError::InvalidConfig {
            chain_id: id.clone(),
            reason: err.to_string(),
        })?;
        config.validate().map_err(|err| ChainError::InvalidConfig {
            chain_id: id.clone(),
            reason: err.to_string(),
        })?;

        let node = selector
            .select(&nodes)
            .ok_or_else(|| ChainError::NoNodes(id.clone()))?;
        info!(
            chain_id = %id,
            "{} node(s) configured, using {} ({}).",
            nodes.len(),
            node.name,
            node.url
        );

        let client = connect(node).map_err(|error| ChainError::Connect {
            chain_id: id.clone(),
            node: node.name.clone(),
            error,
        })?;
        let client = Arc::new(client);
        let txm = Txm::new(&id, client.clone(), collaborators, &cfg, config);

        Ok(Chain {
            id,
            cfg,
            nodes,
            client,
            txm,
            balance_monitor: None,
            once: StartStopOnce::new("Chain"),
        })
    }

    pub fn with_balance_monitor(mut self, monitor: Arc<dyn BalanceMonitor>) -> Chain<C> {
        self.balance_monitor = Some(monitor);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ChainCfg {
        &self.cfg
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn state(&self) -> State {
        self.once.state()
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn reader(&self) -> &dyn Reader {
        self.client.as_ref()
    }

    pub fn msg_enqueuer(&self) -> &dyn MsgEnqueuer {
        &self.txm
    }

    pub fn txm(&self) -> &Txm<C> {
        &self.txm
    }

    pub fn balance_monitor(&self) -> Option<&dyn BalanceMonitor> {
        self.balance_monitor.as_deref()
    }

    pub async fn start(&self) -> Result<(), ChainError> {
        self.once
            .start_once(|| async {
                debug!(chain_id = %self.id, "Starting chain.");
                self.txm.start().await.map_err(ChainError::from)
            })
            .await
    }

    pub async fn close(&self) -> Result<(), ChainError> {
        self.once
            .stop_once(|| async {
                debug!(chain_id = %self.id, "Closing chain.");
                self.txm.close().await.map_err(ChainError::from)
            })
            .await
    }

    pub fn ready(&self) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        errors.collect(self.once.ready());
        errors.absorb(self.txm.ready());
        errors.into_result()
    }

    pub async fn healthy(&self) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        errors.collect(self.once.healthy());
        errors.absorb(self.txm.healthy().await);
        errors.into_result()
    }
}
