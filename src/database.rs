use anyhow::Result;
use async_trait::async_trait;
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::transaction::{
    unix_now, GasQuote, NewTransaction, PendingTransaction, TxId, TxStatus,
};

/// Durable, transactional store of transaction records shared by the
/// transaction managers of every chain. Each operation is atomic: on error
/// nothing of it is visible.
#[async_trait]
pub trait Ledger: Debug + Send + Sync {
    /// Highest sequence still held by a record of `account` on `chain_id`.
    async fn last_sequence(&self, chain_id: &str, account: Address) -> Result<Option<u64>>;

    /// Stores a new `queued` record. Fails if the (chain, account, sequence)
    /// key is held by another record.
    async fn insert(&self, tx: NewTransaction) -> Result<PendingTransaction>;

    async fn get(&self, id: TxId) -> Result<Option<PendingTransaction>>;

    /// Queued records of `chain_id`, ordered by (account, sequence).
    async fn queued(&self, chain_id: &str) -> Result<Vec<PendingTransaction>>;

    /// Broadcast but unconfirmed records of `chain_id`, ordered by
    /// (account, sequence).
    async fn in_flight(&self, chain_id: &str) -> Result<Vec<PendingTransaction>>;

    async fn mark_broadcast(&self, id: TxId, hash: H256, gas: GasQuote) -> Result<()>;

    async fn mark_confirmed(&self, id: TxId) -> Result<()>;

    async fn mark_failed(&self, id: TxId, error: &str) -> Result<()>;

    /// Fails a queued record together with every later queued record of its
    /// account, in one operation. Returns the failed records by sequence.
    async fn fail_queued(&self, id: TxId, error: &str) -> Result<Vec<PendingTransaction>>;

    /// Checks that the store is usable.
    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("transaction {0} does not exist")]
    NotFound(TxId),

    #[error("transaction {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: TxId,
        from: TxStatus,
        to: TxStatus,
    },

    #[error("sequence {sequence} of account {account:?} on chain {chain_id} is already taken")]
    DuplicateSequence {
        chain_id: String,
        account: Address,
        sequence: u64,
    },
}

/// In-memory state machine of the ledger records. Implementations add
/// durability around it.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    next_id: TxId,
    records: BTreeMap<TxId, PendingTransaction>,
}

impl LedgerState {
    pub fn new() -> LedgerState {
        LedgerState::default()
    }

    pub fn last_sequence(&self, chain_id: &str, account: Address) -> Option<u64> {
        self.records
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.account == account)
            .filter(|tx| tx.holds_sequence())
            .map(|tx| tx.sequence)
            .max()
    }

    pub fn insert(&mut self, tx: NewTransaction) -> Result<PendingTransaction, LedgerError> {
        let taken = self.records.values().any(|other| {
            other.chain_id == tx.chain_id
                && other.account == tx.account
                && other.sequence == tx.sequence
                && other.holds_sequence()
        });
        if taken {
            return Err(LedgerError::DuplicateSequence {
                chain_id: tx.chain_id,
                account: tx.account,
                sequence: tx.sequence,
            });
        }

        self.next_id += 1;
        let record = PendingTransaction::from_new(self.next_id, tx);
        self.records.insert(record.id, record.clone());
        Ok(record)
    }

    pub fn get(&self, id: TxId) -> Option<&PendingTransaction> {
        self.records.get(&id)
    }

    pub fn with_status(&self, chain_id: &str, status: TxStatus) -> Vec<PendingTransaction> {
        let mut txs: Vec<PendingTransaction> = self
            .records
            .values()
            .filter(|tx| tx.chain_id == chain_id && tx.status == status)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| (tx.account, tx.sequence));
        txs
    }

    pub fn mark_broadcast(&mut self, id: TxId, hash: H256, gas: GasQuote) -> Result<(), LedgerError> {
        let tx = self.transition(id, &[TxStatus::Queued], TxStatus::Broadcast)?;
        tx.hash = Some(hash);
        tx.gas = Some(gas);
        Ok(())
    }

    pub fn mark_confirmed(&mut self, id: TxId) -> Result<(), LedgerError> {
        self.transition(id, &[TxStatus::Broadcast], TxStatus::Confirmed)?;
        Ok(())
    }

    pub fn mark_failed(&mut self, id: TxId, error: &str) -> Result<(), LedgerError> {
        let tx = self.transition(id, &[TxStatus::Queued, TxStatus::Broadcast], TxStatus::Failed)?;
        tx.error = Some(error.to_string());
        Ok(())
    }

    pub fn fail_queued(
        &mut self,
        id: TxId,
        error: &str,
    ) -> Result<Vec<PendingTransaction>, LedgerError> {
        let first = self.transition(id, &[TxStatus::Queued], TxStatus::Failed)?;
        first.error = Some(error.to_string());
        let first = first.clone();

        let later = format!("sequence {} failed before broadcast: {}", first.sequence, error);
        let mut failed = vec![first.clone()];
        for tx in self.records.values_mut() {
            if tx.chain_id == first.chain_id
                && tx.account == first.account
                && tx.sequence > first.sequence
                && tx.status == TxStatus::Queued
            {
                tx.status = TxStatus::Failed;
                tx.error = Some(later.clone());
                tx.updated_at = first.updated_at;
                failed.push(tx.clone());
            }
        }
        failed.sort_by_key(|tx| tx.sequence);
        Ok(failed)
    }

    /// Drops terminal records last updated before `cutoff` (unix seconds).
    /// The record holding the highest sequence of each account stays, so
    /// sequencing carries on from the ledger.
    pub fn prune(&mut self, cutoff: u64) -> usize {
        let mut last: BTreeMap<(String, Address), (u64, TxId)> = BTreeMap::new();
        for tx in self.records.values().filter(|tx| tx.holds_sequence()) {
            let entry = last
                .entry((tx.chain_id.clone(), tx.account))
                .or_insert((tx.sequence, tx.id));
            if tx.sequence > entry.0 {
                *entry = (tx.sequence, tx.id);
            }
        }
        let kept: Vec<TxId> = last.values().map(|(_, id)| *id).collect();

        let before = self.records.len();
        self.records.retain(|id, tx| {
            !tx.status.is_terminal() || tx.updated_at >= cutoff || kept.contains(id)
        });
        before - self.records.len()
    }

    fn transition(
        &mut self,
        id: TxId,
        from: &[TxStatus],
        to: TxStatus,
    ) -> Result<&mut PendingTransaction, LedgerError> {
        let tx = self.records.get_mut(&id).ok_or(LedgerError::NotFound(id))?;
        if !from.contains(&tx.status) {
            return Err(LedgerError::InvalidTransition {
                id,
                from: tx.status,
                to,
            });
        }
        tx.status = to;
        tx.updated_at = unix_now();
        Ok(tx)
    }
}

// Implementation using the file system.

#[derive(Debug, thiserror::Error)]
pub enum FileSystemLedgerError {
    #[error("could not create file: {0}")]
    CreateFile(std::io::Error),

    #[error("could not convert the ledger to JSON: {0}")]
    ToJSON(serde_json::Error),

    #[error("could not write to file: {0}")]
    WriteToFile(std::io::Error),

    #[error("could not replace the ledger file: {0}")]
    Rename(std::io::Error),

    #[error("could not read file: {0}")]
    ReadFile(std::io::Error),

    #[error("could not parse the ledger file: {0}")]
    ParseJSON(serde_json::Error),
}

/// Ledger kept as a JSON file. Every write goes to a temporary file that is
/// synced and then renamed over the previous version, so a crash leaves
/// either the old or the new ledger on disk.
#[derive(Debug)]
pub struct FileSystemLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl FileSystemLedger {
    /// Opens the ledger at `path`, reloading the records of a previous run.
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<FileSystemLedger, FileSystemLedgerError> {
        let path = path.into();
        let state = match fs::File::open(&path).await {
            Err(err) if err.kind() == ErrorKind::NotFound => LedgerState::new(),

            Err(err) => return Err(FileSystemLedgerError::ReadFile(err)),

            Ok(mut file) => {
                let mut s = String::new();
                file.read_to_string(&mut s)
                    .await
                    .map_err(FileSystemLedgerError::ReadFile)?;
                serde_json::from_str(&s).map_err(FileSystemLedgerError::ParseJSON)?
            }
        };

        Ok(FileSystemLedger {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes terminal records older than `retention` from the file.
    /// Returns how many were dropped.
    pub async fn compact(&self, retention: Duration) -> Result<usize> {
        let cutoff = unix_now().saturating_sub(retention.as_secs());
        let pruned = self.update(|state| Ok(state.prune(cutoff))).await?;
        debug!("Compacted the ledger: {} record(s) dropped.", pruned);
        Ok(pruned)
    }

    async fn persist(&self, state: &LedgerState) -> Result<(), FileSystemLedgerError> {
        let tmp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&tmp_path)
            .await
            .map_err(FileSystemLedgerError::CreateFile)?;

        let s = serde_json::to_string_pretty(state).map_err(FileSystemLedgerError::ToJSON)?;

        file.write_all(s.as_bytes())
            .await
            .map_err(FileSystemLedgerError::WriteToFile)?;

        file.sync_all()
            .await
            .map_err(FileSystemLedgerError::WriteToFile)?;

        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(FileSystemLedgerError::Rename)?;

        trace!("ledger persisted to {:?}", self.path);
        Ok(())
    }

    /// Applies `f` to a copy of the state, persists the copy and only then
    /// makes it visible.
    async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut LedgerState) -> Result<T, LedgerError> + Send,
        T: Send,
    {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let value = f(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(value)
    }
}

#[async_trait]
impl Ledger for FileSystemLedger {
    async fn last_sequence(&self, chain_id: &str, account: Address) -> Result<Option<u64>> {
        Ok(self.state.lock().await.last_sequence(chain_id, account))
    }

    async fn insert(&self, tx: NewTransaction) -> Result<PendingTransaction> {
        self.update(|state| state.insert(tx)).await
    }

    async fn get(&self, id: TxId) -> Result<Option<PendingTransaction>> {
        Ok(self.state.lock().await.get(id).cloned())
    }

    async fn queued(&self, chain_id: &str) -> Result<Vec<PendingTransaction>> {
        Ok(self.state.lock().await.with_status(chain_id, TxStatus::Queued))
    }

    async fn in_flight(&self, chain_id: &str) -> Result<Vec<PendingTransaction>> {
        Ok(self
            .state
            .lock()
            .await
            .with_status(chain_id, TxStatus::Broadcast))
    }

    async fn mark_broadcast(&self, id: TxId, hash: H256, gas: GasQuote) -> Result<()> {
        self.update(|state| state.mark_broadcast(id, hash, gas)).await
    }

    async fn mark_confirmed(&self, id: TxId) -> Result<()> {
        self.update(|state| state.mark_confirmed(id)).await
    }

    async fn mark_failed(&self, id: TxId, error: &str) -> Result<()> {
        self.update(|state| state.mark_failed(id, error)).await
    }

    async fn fail_queued(&self, id: TxId, error: &str) -> Result<Vec<PendingTransaction>> {
        self.update(|state| state.fail_queued(id, error)).await
    }

    async fn ping(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::metadata(dir)
            .await
            .map_err(FileSystemLedgerError::ReadFile)?;
        Ok(())
    }
}

// Unit tests for the ledger.

#[cfg(test)]
mod test {
    use ethers::types::{Address, H256, U256};
    use serial_test::serial;
    use std::fs::{remove_file, File};
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::database::{
        FileSystemLedger, FileSystemLedgerError, Ledger, LedgerError, LedgerState,
    };
    use crate::transaction::{GasQuote, NewTransaction, TxStatus};

    /// Auxiliary.
    fn new_transaction(chain_id: &str, account: u64, sequence: u64) -> NewTransaction {
        NewTransaction {
            chain_id: chain_id.to_string(),
            account: Address::from_low_u64_be(account),
            destination: Address::from_low_u64_be(100),
            amount: U256::from(5000u64),
            gas_limit: 21_000,
            sequence,
        }
    }

    fn quote() -> GasQuote {
        GasQuote {
            price: U256::from(10u64),
            limit: 21_000,
        }
    }

    fn setup(str: &str) -> PathBuf {
        let path = PathBuf::from(str);
        let _ = remove_file(&path);
        let _ = remove_file(path.with_extension("tmp"));
        path
    }

    #[test]
    fn test_ledger_state_rejects_duplicate_sequences() {
        let mut state = LedgerState::new();
        assert!(state.insert(new_transaction("a", 1, 0)).is_ok());
        assert!(state.insert(new_transaction("b", 1, 0)).is_ok());
        assert!(state.insert(new_transaction("a", 2, 0)).is_ok());

        let result = state.insert(new_transaction("a", 1, 0));
        assert!(matches!(
            result,
            Err(LedgerError::DuplicateSequence { sequence: 0, .. })
        ));
        assert_eq!(state.last_sequence("a", Address::from_low_u64_be(1)), Some(0));
        assert_eq!(state.last_sequence("c", Address::from_low_u64_be(1)), None);
    }

    #[test]
    fn test_ledger_state_orders_by_account_then_sequence() {
        let mut state = LedgerState::new();
        state.insert(new_transaction("a", 2, 1)).unwrap();
        state.insert(new_transaction("a", 1, 4)).unwrap();
        state.insert(new_transaction("a", 2, 0)).unwrap();
        state.insert(new_transaction("a", 1, 3)).unwrap();
        state.insert(new_transaction("b", 1, 0)).unwrap();

        let keys: Vec<(u64, u64)> = state
            .with_status("a", TxStatus::Queued)
            .iter()
            .map(|tx| (tx.account.to_low_u64_be(), tx.sequence))
            .collect();
        assert_eq!(keys, vec![(1, 3), (1, 4), (2, 0), (2, 1)]);
    }

    #[test]
    fn test_ledger_state_transitions() {
        let mut state = LedgerState::new();
        let id = state.insert(new_transaction("a", 1, 0)).unwrap().id;

        // error => cannot confirm a queued transaction
        assert!(matches!(
            state.mark_confirmed(id),
            Err(LedgerError::InvalidTransition { .. })
        ));

        let hash = H256::from_low_u64_be(42);
        state.mark_broadcast(id, hash, quote()).unwrap();
        assert_eq!(state.get(id).unwrap().hash, Some(hash));
        assert_eq!(state.get(id).unwrap().gas, Some(quote()));

        state.mark_confirmed(id).unwrap();
        assert_eq!(state.get(id).unwrap().status, TxStatus::Confirmed);

        // error => confirmed is terminal
        assert!(state.mark_failed(id, "late").is_err());
        assert!(matches!(state.mark_failed(99, "x"), Err(LedgerError::NotFound(99))));
    }

    #[test]
    fn test_ledger_state_fail_queued_releases_later_sequences() {
        let mut state = LedgerState::new();
        let account = Address::from_low_u64_be(1);
        let sent = state.insert(new_transaction("a", 1, 0)).unwrap().id;
        state
            .mark_broadcast(sent, H256::from_low_u64_be(1), quote())
            .unwrap();
        state.mark_confirmed(sent).unwrap();
        let first = state.insert(new_transaction("a", 1, 1)).unwrap().id;
        state.insert(new_transaction("a", 1, 2)).unwrap();
        let other_account = state.insert(new_transaction("a", 2, 2)).unwrap().id;
        let other_chain = state.insert(new_transaction("b", 1, 2)).unwrap().id;

        let failed = state.fail_queued(first, "insufficient funds").unwrap();
        let sequences: Vec<u64> = failed.iter().map(|tx| tx.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert!(failed.iter().all(|tx| tx.status == TxStatus::Failed));
        assert_eq!(failed[0].error.as_deref(), Some("insufficient funds"));
        assert_eq!(
            failed[1].error.as_deref(),
            Some("sequence 1 failed before broadcast: insufficient funds")
        );

        // Other accounts and chains are left alone.
        assert_eq!(state.get(other_account).unwrap().status, TxStatus::Queued);
        assert_eq!(state.get(other_chain).unwrap().status, TxStatus::Queued);

        // The released sequences can be taken again.
        assert_eq!(state.last_sequence("a", account), Some(0));
        let retry = state.insert(new_transaction("a", 1, 1)).unwrap();
        assert_eq!(retry.status, TxStatus::Queued);

        // error => only queued records can be failed this way
        assert!(matches!(
            state.fail_queued(sent, "late"),
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_ledger_state_prune_keeps_live_and_last_records() {
        let mut state = LedgerState::new();
        let account = Address::from_low_u64_be(1);
        let mut confirmed = Vec::new();
        for sequence in 0..3 {
            let id = state.insert(new_transaction("a", 1, sequence)).unwrap().id;
            state
                .mark_broadcast(id, H256::from_low_u64_be(sequence + 1), quote())
                .unwrap();
            state.mark_confirmed(id).unwrap();
            confirmed.push(id);
        }
        let queued = state.insert(new_transaction("b", 1, 0)).unwrap().id;

        // Nothing is old enough.
        assert_eq!(state.prune(0), 0);

        assert_eq!(state.prune(u64::MAX), 2);
        assert!(state.get(confirmed[0]).is_none());
        assert!(state.get(confirmed[1]).is_none());
        assert!(state.get(confirmed[2]).is_some());
        assert!(state.get(queued).is_some());
        assert_eq!(state.last_sequence("a", account), Some(2));
    }

    #[tokio::test]
    #[serial]
    async fn test_file_system_ledger_reloads_records() {
        let path = setup("./reload_ledger.json");

        let id = {
            let ledger = FileSystemLedger::open(&path).await.unwrap();
            let tx = ledger.insert(new_transaction("a", 1, 0)).await.unwrap();
            ledger
                .mark_broadcast(tx.id, H256::from_low_u64_be(1), quote())
                .await
                .unwrap();
            ledger.insert(new_transaction("a", 1, 1)).await.unwrap();
            tx.id
        };
        assert!(path.is_file());

        let ledger = FileSystemLedger::open(&path).await.unwrap();
        let reloaded = ledger.get(id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, TxStatus::Broadcast);
        assert_eq!(ledger.in_flight("a").await.unwrap().len(), 1);
        assert_eq!(ledger.queued("a").await.unwrap().len(), 1);
        assert_eq!(
            ledger
                .last_sequence("a", Address::from_low_u64_be(1))
                .await
                .unwrap(),
            Some(1)
        );

        // ids keep increasing after a reload
        let next = ledger.insert(new_transaction("a", 1, 2)).await.unwrap();
        assert!(next.id > id + 1);

        remove_file(&path).unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_file_system_ledger_compaction() {
        let path = setup("./compact_ledger.json");
        let ledger = FileSystemLedger::open(&path).await.unwrap();

        let old = ledger.insert(new_transaction("a", 1, 0)).await.unwrap();
        ledger.fail_queued(old.id, "rejected").await.unwrap();
        ledger.insert(new_transaction("a", 1, 0)).await.unwrap();

        assert_eq!(ledger.compact(Duration::from_secs(3600)).await.unwrap(), 0);

        // Records dated in the past are dropped from the file.
        let mut state = ledger.state.lock().await.clone();
        for tx in state.records.values_mut() {
            tx.updated_at = 0;
        }
        *ledger.state.lock().await = state;
        assert_eq!(ledger.compact(Duration::from_secs(60)).await.unwrap(), 1);
        assert!(ledger.get(old.id).await.unwrap().is_none());

        let reloaded = FileSystemLedger::open(&path).await.unwrap();
        assert!(reloaded.get(old.id).await.unwrap().is_none());
        assert_eq!(reloaded.queued("a").await.unwrap().len(), 1);

        remove_file(&path).unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_file_system_ledger_failed_write_is_invisible() {
        // error => could not create the temporary file (missing directory)
        let ledger = FileSystemLedger::open("./missing-directory/ledger.json")
            .await
            .unwrap();
        let result = ledger.insert(new_transaction("a", 1, 0)).await;
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(
            matches!(
                err.downcast_ref::<FileSystemLedgerError>(),
                Some(FileSystemLedgerError::CreateFile(_))
            ),
            "expected CreateFile error, got {}",
            err
        );
        assert!(ledger.queued("a").await.unwrap().is_empty());
        assert!(ledger.ping().await.is_err());
    }

    #[tokio::test]
    #[serial]
    async fn test_file_system_ledger_open_error() {
        // error => could not parse the file
        let path = setup("./corrupted_ledger.json");
        let mut file = File::create(&path).unwrap();
        file.write_all("this is not a JSON!".as_bytes()).unwrap();

        let result = FileSystemLedger::open(&path).await;
        assert!(
            matches!(result, Err(FileSystemLedgerError::ParseJSON(_))),
            "expected ParseJSON error, got {:?}",
            result
        );

        remove_file(&path).unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_file_system_ledger_ping() {
        let path = setup("./ping_ledger.json");
        let ledger = FileSystemLedger::open(&path).await.unwrap();
        assert!(ledger.ping().await.is_ok());
        assert!(!path.is_file());
    }
}
