use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, BlockId, BlockNumber, H256, U256, U64};
use std::fmt::Debug;
use std::time::Duration;
use tracing::{trace, warn};

use crate::chain::Node;
use crate::signer::SignedTransaction;

/// Default timeout of a request to a node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Node error messages meaning the network refused the transaction for good.
const REJECTIONS: [&str; 6] = [
    "transaction underpriced",
    "replacement transaction underpriced",
    "nonce too low",
    "insufficient funds",
    "intrinsic gas too low",
    "exceeds block gas limit",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// Retryable failure (connection, timeout, unavailable node).
    #[error("transient network error: {0}")]
    Transient(String),

    /// The network refused the transaction; resending it is never safe.
    #[error("rejected by the network: {0}")]
    Rejected(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finality {
    Pending,
    Finalized,
    Rejected(String),
}

/// Read-only view of a chain.
#[async_trait]
pub trait Reader: Debug + Send + Sync {
    async fn balance_at(&self, account: Address) -> Result<U256, ClientError>;

    /// Live legacy gas price; zero when the node has no estimate.
    async fn gas_price(&self) -> Result<U256, ClientError>;

    /// Next sequence (pending transaction count) of `account`.
    async fn sequence_at(&self, account: Address) -> Result<u64, ClientError>;
}

/// Connection to one network endpoint.
#[async_trait]
pub trait NetworkClient: Reader {
    /// Submits a signed transaction and returns its hash.
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<H256, ClientError>;

    /// Whether the transaction reached `confirmations` blocks of depth.
    async fn finality(&self, hash: H256, confirmations: u64) -> Result<Finality, ClientError>;
}

// Implementation using an ethers middleware.

#[derive(Debug)]
pub struct EthersClient<M> {
    provider: M,
}

impl<M: Middleware> EthersClient<M> {
    pub fn new(provider: M) -> EthersClient<M> {
        EthersClient { provider }
    }

    pub fn provider(&self) -> &M {
        &self.provider
    }
}

impl EthersClient<Provider<Http>> {
    /// Dials the primary URL of `node` over HTTP.
    pub fn connect(node: &Node) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        let http = Http::new_with_client(node.url.clone(), client);
        Ok(EthersClient::new(Provider::new(http)))
    }
}

#[async_trait]
impl<M> Reader for EthersClient<M>
where
    M: Middleware + Debug + Send + Sync,
{
    async fn balance_at(&self, account: Address) -> Result<U256, ClientError> {
        self.provider
            .get_balance(account, None)
            .await
            .map_err(classify)
    }

    async fn gas_price(&self) -> Result<U256, ClientError> {
        self.provider.get_gas_price().await.map_err(classify)
    }

    async fn sequence_at(&self, account: Address) -> Result<u64, ClientError> {
        let count = self
            .provider
            .get_transaction_count(account, Some(BlockId::Number(BlockNumber::Pending)))
            .await
            .map_err(classify)?;
        if count > U256::from(u64::MAX) {
            return Err(ClientError::Transient(format!(
                "transaction count {} does not fit a sequence",
                count
            )));
        }
        Ok(count.low_u64())
    }
}

#[async_trait]
impl<M> NetworkClient for EthersClient<M>
where
    M: Middleware + Debug + Send + Sync,
{
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<H256, ClientError> {
        match self.provider.send_raw_transaction(tx.raw.clone()).await {
            Ok(pending_transaction) => Ok(*pending_transaction),
            Err(err) if is_error(&err, "already known") => {
                warn!("Tried to send an already known transaction ({:?}).", tx.hash);
                Ok(tx.hash)
            }
            Err(err) => Err(classify(err)),
        }
    }

    async fn finality(&self, hash: H256, confirmations: u64) -> Result<Finality, ClientError> {
        let receipt = match self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(classify)?
        {
            Some(receipt) => receipt,
            None => return Ok(Finality::Pending),
        };

        if receipt.status == Some(U64::zero()) {
            return Ok(Finality::Rejected("transaction reverted".to_string()));
        }

        let transaction_block = match receipt.block_number {
            Some(block) => block.as_u64(),
            None => return Ok(Finality::Pending),
        };
        let current_block = self
            .provider
            .get_block_number()
            .await
            .map_err(classify)?
            .as_u64();

        trace!(
            "Mined transaction block: {}, current block: {}.",
            transaction_block,
            current_block
        );

        let depth = current_block.saturating_sub(transaction_block);
        if depth >= confirmations {
            Ok(Finality::Finalized)
        } else {
            Ok(Finality::Pending)
        }
    }
}

fn classify<E>(err: E) -> ClientError
where
    E: Debug + std::fmt::Display,
{
    if REJECTIONS.iter().any(|s| is_error(&err, s)) {
        ClientError::Rejected(err.to_string())
    } else {
        ClientError::Transient(err.to_string())
    }
}

fn is_error<E>(err: &E, s: &str) -> bool
where
    E: Debug,
{
    format!("{:?}", err).contains(s)
}
