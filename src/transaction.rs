use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Ledger-assigned identifier of a transaction record.
pub type TxId = u64;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Queued,
    Broadcast,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::Queued => "queued",
            TxStatus::Broadcast => "broadcast",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Legacy gas price and limit computed for one transaction. Never reused
/// across requests.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasQuote {
    pub price: U256, // in wei
    pub limit: u64,
}

impl GasQuote {
    /// `price × limit`, or `None` on overflow.
    pub fn fee(&self) -> Option<U256> {
        self.price.checked_mul(U256::from(self.limit))
    }
}

/// Data supplied by the transaction manager when queueing a transaction. The
/// ledger assigns the id, status and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub chain_id: String,
    pub account: Address,
    pub destination: Address,
    pub amount: U256,
    pub gas_limit: u64,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub id: TxId,
    pub chain_id: String,
    pub account: Address,
    pub destination: Address,
    pub amount: U256, // in wei
    pub gas_limit: u64,

    /// Per-account sequence number (the account nonce).
    pub sequence: u64,

    pub status: TxStatus,

    /// Gas used for the broadcast that reached the network.
    pub gas: Option<GasQuote>,

    pub hash: Option<H256>,

    /// Reason of the failure, for failed records.
    pub error: Option<String>,

    pub created_at: u64, // unix seconds
    pub updated_at: u64, // unix seconds
}

impl PendingTransaction {
    pub fn from_new(id: TxId, tx: NewTransaction) -> PendingTransaction {
        let now = unix_now();
        PendingTransaction {
            id,
            chain_id: tx.chain_id,
            account: tx.account,
            destination: tx.destination,
            amount: tx.amount,
            gas_limit: tx.gas_limit,
            sequence: tx.sequence,
            status: TxStatus::Queued,
            gas: None,
            hash: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A record that failed before reaching the network gives its sequence
    /// back to the account.
    pub fn holds_sequence(&self) -> bool {
        !(self.status == TxStatus::Failed && self.hash.is_none())
    }

    /// Legacy request for `network_id` (the EIP-155 chain id). Without one the
    /// signer's own chain id is used.
    pub fn to_legacy_transaction_request(
        &self,
        network_id: Option<u64>,
        gas: &GasQuote,
    ) -> TypedTransaction {
        let request = TransactionRequest::new()
            .from(self.account)
            .to(self.destination)
            .value(self.amount)
            .gas(gas.limit)
            .gas_price(gas.price)
            .nonce(self.sequence);
        let mut tx = TypedTransaction::Legacy(request);
        if let Some(id) = network_id {
            tx.set_chain_id(id);
        }
        tx
    }
}

/// Caller-facing view of a transaction record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResource {
    pub id: TxId,
    pub status: TxStatus,
    pub hash: Option<H256>,
    pub sequence: u64,
    pub error: Option<String>,
}

impl From<&PendingTransaction> for TransactionResource {
    fn from(tx: &PendingTransaction) -> Self {
        TransactionResource {
            id: tx.id,
            status: tx.status,
            hash: tx.hash,
            sequence: tx.sequence,
            error: tx.error.clone(),
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
