use anyhow::Result;
use async_trait::async_trait;
use chain_txm::database::{Ledger, LedgerState};
use chain_txm::transaction::{GasQuote, NewTransaction, PendingTransaction, TxId, TxStatus};
use ethers::types::{Address, H256};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum MockLedgerError {
    #[error("ledger mock error: insert")]
    Insert,

    #[error("ledger mock error: read")]
    Read,

    #[error("ledger mock error: ping")]
    Ping,
}

/// In-memory ledger with switchable failures.
#[derive(Debug, Default)]
pub struct MockLedger {
    state: Mutex<LedgerState>,
    pub fail_insert: AtomicBool,
    pub fail_read: AtomicBool,
    pub fail_ping: AtomicBool,
    pub insert_n: AtomicUsize,
}

impl MockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_n(&self) -> usize {
        self.insert_n.load(Ordering::SeqCst)
    }

    pub async fn records(&self, chain_id: &str) -> Vec<PendingTransaction> {
        let state = self.state.lock().await;
        let mut records = Vec::new();
        for status in [
            TxStatus::Queued,
            TxStatus::Broadcast,
            TxStatus::Confirmed,
            TxStatus::Failed,
        ] {
            records.extend(state.with_status(chain_id, status));
        }
        records.sort_by_key(|tx| tx.id);
        records
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(MockLedgerError::Read.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn last_sequence(&self, chain_id: &str, account: Address) -> Result<Option<u64>> {
        self.check_read()?;
        Ok(self.state.lock().await.last_sequence(chain_id, account))
    }

    async fn insert(&self, tx: NewTransaction) -> Result<PendingTransaction> {
        self.insert_n.fetch_add(1, Ordering::SeqCst);
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(MockLedgerError::Insert.into());
        }
        Ok(self.state.lock().await.insert(tx)?)
    }

    async fn get(&self, id: TxId) -> Result<Option<PendingTransaction>> {
        self.check_read()?;
        Ok(self.state.lock().await.get(id).cloned())
    }

    async fn queued(&self, chain_id: &str) -> Result<Vec<PendingTransaction>> {
        self.check_read()?;
        Ok(self.state.lock().await.with_status(chain_id, TxStatus::Queued))
    }

    async fn in_flight(&self, chain_id: &str) -> Result<Vec<PendingTransaction>> {
        self.check_read()?;
        Ok(self.state.lock().await.with_status(chain_id, TxStatus::Broadcast))
    }

    async fn mark_broadcast(&self, id: TxId, hash: H256, gas: GasQuote) -> Result<()> {
        Ok(self.state.lock().await.mark_broadcast(id, hash, gas)?)
    }

    async fn mark_confirmed(&self, id: TxId) -> Result<()> {
        Ok(self.state.lock().await.mark_confirmed(id)?)
    }

    async fn mark_failed(&self, id: TxId, error: &str) -> Result<()> {
        Ok(self.state.lock().await.mark_failed(id, error)?)
    }

    async fn fail_queued(&self, id: TxId, error: &str) -> Result<Vec<PendingTransaction>> {
        Ok(self.state.lock().await.fail_queued(id, error)?)
    }

    async fn ping(&self) -> Result<()> {
        if self.fail_ping.load(Ordering::SeqCst) {
            return Err(MockLedgerError::Ping.into());
        }
        Ok(())
    }
}
