use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::chain::{Chain, ChainError};
use crate::client::NetworkClient;
use crate::health::MultiError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainSetError {
    #[error("invalid chain id: {0}")]
    InvalidChainId(String),

    #[error("more than one chain available, you must specify chain id parameter")]
    MultipleChains,

    #[error("chain id does not match any local chains")]
    MissingChainId,

    #[error("chain {0} is configured more than once")]
    Duplicate(String),
}

/// Every chain the node talks to, keyed by id.
#[derive(Debug)]
pub struct ChainSet<C> {
    chains: BTreeMap<String, Arc<Chain<C>>>,
}

impl<C: NetworkClient + 'static> ChainSet<C> {
    pub fn new(chains: Vec<Chain<C>>) -> Result<ChainSet<C>, ChainSetError> {
        let mut map = BTreeMap::new();
        for chain in chains {
            let id = chain.id().to_string();
            if map.insert(id.clone(), Arc::new(chain)).is_some() {
                return Err(ChainSetError::Duplicate(id));
            }
        }
        Ok(ChainSet { chains: map })
    }

    pub fn get(&self, id: &str) -> Option<Arc<Chain<C>>> {
        self.chains.get(id).cloned()
    }

    /// The only chain, when exactly one is configured.
    pub fn default_chain(&self) -> Result<Arc<Chain<C>>, ChainSetError> {
        match self.chains.len() {
            0 => Err(ChainSetError::MissingChainId),
            1 => self
                .chains
                .values()
                .next()
                .cloned()
                .ok_or(ChainSetError::MissingChainId),
            _ => Err(ChainSetError::MultipleChains),
        }
    }

    /// Resolves a caller-supplied chain id. An empty or absent id selects the
    /// default chain.
    pub fn resolve(&self, id: Option<&str>) -> Result<Arc<Chain<C>>, ChainSetError> {
        match id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => self
                .get(id)
                .ok_or_else(|| ChainSetError::InvalidChainId(id.to_string())),
            None => self.default_chain(),
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.chains.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Starts every chain. Chains that fail to start do not prevent the
    /// others from starting.
    pub async fn start(&self) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        for chain in self.chains.values() {
            if let Err(err) = chain.start().await {
                error!(chain_id = %chain.id(), "Failed to start chain: {}.", err);
                errors.push(err);
            }
        }
        info!("Started {} of {} chain(s).", self.chains.len() - errors.len(), self.chains.len());
        errors.into_result()
    }

    pub async fn close(&self) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        for chain in self.chains.values() {
            errors.collect::<(), ChainError>(chain.close().await);
        }
        errors.into_result()
    }

    pub fn ready(&self) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        for chain in self.chains.values() {
            errors.absorb(chain.ready());
        }
        errors.into_result()
    }

    pub async fn healthy(&self) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        for chain in self.chains.values() {
            errors.absorb(chain.healthy().await);
        }
        errors.into_result()
    }
}
