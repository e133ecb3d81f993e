use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::client::{ClientError, Finality, NetworkClient};
use crate::config::{ChainCfg, TxmConfig};
use crate::database::Ledger;
use crate::events::{EventBroadcaster, TxEvent};
use crate::gas_estimator::{GasEstimator, GasEstimatorError};
use crate::health::MultiError;
use crate::lifecycle::{LifecycleError, StartStopOnce, State};
use crate::signer::Signer;
use crate::time::{backoff, MAX_BACKOFF};
use crate::transaction::{GasQuote, NewTransaction, PendingTransaction, TxId};

#[derive(Debug, thiserror::Error)]
pub enum TxmError {
    #[error("account {0:?} is unknown to the signer")]
    NoAccount(Address),

    #[error("invalid transaction: {0}")]
    Invalid(String),

    #[error("could not read the sequence of {account:?}: {source}")]
    Sequence {
        account: Address,
        source: ClientError,
    },

    #[error("ledger: {0:#}")]
    Persist(anyhow::Error),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("background loop: {0}")]
    Join(JoinError),
}

/// Queues transactions for asynchronous submission.
#[async_trait]
pub trait MsgEnqueuer: Send + Sync {
    /// Persists a `queued` transaction with the next sequence of `account`
    /// and returns it. Broadcasting happens later, in the background.
    async fn enqueue(
        &self,
        account: Address,
        destination: Address,
        amount: U256,
        gas_limit: u64,
    ) -> Result<PendingTransaction, TxmError>;
}

/// Shared services a transaction manager writes to. The ledger may be shared
/// by the managers of every chain.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn Ledger>,
    pub signer: Arc<dyn Signer>,
    pub broadcaster: Arc<dyn EventBroadcaster>,
}

#[derive(Debug)]
pub struct Txm<C> {
    inner: Arc<Inner<C>>,
    once: StartStopOnce,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    submitter_alive: Arc<AtomicBool>,
    confirmer_alive: Arc<AtomicBool>,
}

impl<C: NetworkClient + 'static> Txm<C> {
    pub fn new(
        chain_id: &str,
        client: Arc<C>,
        collaborators: Collaborators,
        cfg: &ChainCfg,
        config: TxmConfig,
    ) -> Txm<C> {
        let (shutdown, _) = watch::channel(false);
        let network_id = chain_id.parse::<u64>().ok();
        if network_id.is_none() {
            warn!(
                chain_id,
                "Chain id is not numeric, transactions are signed with the signer's chain id."
            );
        }
        let inner = Inner {
            chain_id: chain_id.to_string(),
            network_id,
            estimator: GasEstimator::new(client.clone(), cfg),
            client,
            ledger: collaborators.ledger,
            signer: collaborators.signer,
            broadcaster: collaborators.broadcaster,
            config,
            locks: AccountLocks::default(),
            health: Mutex::new(LoopHealth::default()),
        };
        Txm {
            inner: Arc::new(inner),
            once: StartStopOnce::new("Txm"),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            submitter_alive: Arc::new(AtomicBool::new(false)),
            confirmer_alive: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.inner.chain_id
    }

    pub fn config(&self) -> &TxmConfig {
        &self.inner.config
    }

    pub fn state(&self) -> State {
        self.once.state()
    }

    pub fn gas_estimator(&self) -> &GasEstimator<C> {
        &self.inner.estimator
    }

    /// Current ledger view of a transaction.
    pub async fn transaction(&self, id: TxId) -> Result<Option<PendingTransaction>, TxmError> {
        self.inner.ledger.get(id).await.map_err(TxmError::Persist)
    }

    /// Spawns the submission and confirmation loops.
    pub async fn start(&self) -> Result<(), TxmError> {
        self.once
            .start_once(|| async {
                let span = info_span!("txm", chain_id = %self.inner.chain_id);

                let submitter = AliveGuard::new(self.submitter_alive.clone());
                let submission = tokio::spawn(
                    self.inner
                        .clone()
                        .submission_loop(self.shutdown.subscribe(), submitter)
                        .instrument(span.clone()),
                );

                let confirmer = AliveGuard::new(self.confirmer_alive.clone());
                let confirmation = tokio::spawn(
                    self.inner
                        .clone()
                        .confirmation_loop(self.shutdown.subscribe(), confirmer)
                        .instrument(span),
                );

                self.lock_tasks().extend([submission, confirmation]);
                info!(
                    chain_id = %self.inner.chain_id,
                    "Transaction manager started (poll interval: {:?}).",
                    self.inner.config.poll_interval
                );
                Ok(())
            })
            .await
    }

    /// Signals both loops to stop and waits for them up to the close timeout.
    /// Loops still running afterwards are aborted; their records stay in
    /// their last persisted state.
    pub async fn close(&self) -> Result<(), TxmError> {
        self.once
            .stop_once(|| async {
                self.shutdown.send_replace(true);

                let tasks = std::mem::take(&mut *self.lock_tasks());
                let mut result = Ok(());
                for mut task in tasks {
                    match tokio::time::timeout(self.inner.config.close_timeout, &mut task).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) if err.is_cancelled() => {}
                        Ok(Err(err)) => {
                            error!(chain_id = %self.inner.chain_id, "Background loop failed: {}.", err);
                            if result.is_ok() {
                                result = Err(TxmError::Join(err));
                            }
                        }
                        Err(_) => {
                            warn!(
                                chain_id = %self.inner.chain_id,
                                "Background loop did not stop within {:?}, aborting it.",
                                self.inner.config.close_timeout
                            );
                            task.abort();
                            let _ = task.await;
                        }
                    }
                }

                info!(chain_id = %self.inner.chain_id, "Transaction manager closed.");
                result
            })
            .await
    }

    pub fn ready(&self) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        errors.collect(self.once.ready());
        if !self.submitter_alive.load(Ordering::SeqCst) {
            errors.push(anyhow!("submission loop is not running"));
        }
        if !self.confirmer_alive.load(Ordering::SeqCst) {
            errors.push(anyhow!("confirmation loop is not running"));
        }
        errors.into_result()
    }

    pub async fn healthy(&self) -> Result<(), MultiError> {
        let mut errors = MultiError::new();
        errors.absorb(self.ready());
        errors.collect(self.inner.ledger.ping().await.context("ledger is unreachable"));

        let health = self.inner.lock_health().clone();
        if let Some(err) = health.submitter {
            errors.push(anyhow!("submission loop: {}", err));
        }
        if let Some(err) = health.confirmer {
            errors.push(anyhow!("confirmation loop: {}", err));
        }
        errors.into_result()
    }

    /// Runs one submission tick: broadcasts the eligible queued records.
    pub async fn process_queued(&self) -> Result<(), TxmError> {
        self.inner
            .process_queued(&mut self.shutdown.subscribe())
            .await
    }

    /// Runs one confirmation tick: checks the finality of broadcast records.
    pub async fn process_in_flight(&self) -> Result<(), TxmError> {
        self.inner.process_in_flight().await
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl<C: NetworkClient + 'static> MsgEnqueuer for Txm<C> {
    async fn enqueue(
        &self,
        account: Address,
        destination: Address,
        amount: U256,
        gas_limit: u64,
    ) -> Result<PendingTransaction, TxmError> {
        self.inner
            .enqueue(account, destination, amount, gas_limit)
            .await
    }
}

#[derive(Debug)]
struct Inner<C> {
    chain_id: String,
    network_id: Option<u64>,
    client: Arc<C>,
    estimator: GasEstimator<C>,
    ledger: Arc<dyn Ledger>,
    signer: Arc<dyn Signer>,
    broadcaster: Arc<dyn EventBroadcaster>,
    config: TxmConfig,
    locks: AccountLocks,
    health: Mutex<LoopHealth>,
}

#[derive(Debug, Clone, Default)]
struct LoopHealth {
    submitter: Option<String>,
    confirmer: Option<String>,
    failing_confirmation_ticks: u32,
}

enum Submission {
    Broadcast,
    Failed,
    Exhausted,
    Cancelled,
}

enum AttemptError {
    Transient {
        reason: String,
        price: Option<U256>,
    },
    Terminal(String),
}

impl<C: NetworkClient + 'static> Inner<C> {
    #[tracing::instrument(level = "trace", skip_all, fields(chain_id = %self.chain_id))]
    async fn enqueue(
        &self,
        account: Address,
        destination: Address,
        amount: U256,
        gas_limit: u64,
    ) -> Result<PendingTransaction, TxmError> {
        if account.is_zero() {
            return Err(TxmError::Invalid("account is empty".to_string()));
        }
        if destination.is_zero() {
            return Err(TxmError::Invalid("destination is the zero address".to_string()));
        }
        if gas_limit == 0 {
            return Err(TxmError::Invalid("gas limit must be positive".to_string()));
        }
        if !self.signer.has_account(account) {
            return Err(TxmError::NoAccount(account));
        }

        let lock = self.locks.get(account);
        let _guard = lock.lock().await;

        let sequence = match self
            .ledger
            .last_sequence(&self.chain_id, account)
            .await
            .map_err(TxmError::Persist)?
        {
            Some(last) => last
                .checked_add(1)
                .ok_or_else(|| TxmError::Invalid("sequence overflow".to_string()))?,
            None => {
                let sequence = self
                    .client
                    .sequence_at(account)
                    .await
                    .map_err(|source| TxmError::Sequence { account, source })?;
                debug!("Seeded the sequence of {:?} from the network: {}.", account, sequence);
                sequence
            }
        };

        let tx = self
            .ledger
            .insert(NewTransaction {
                chain_id: self.chain_id.clone(),
                account,
                destination,
                amount,
                gas_limit,
                sequence,
            })
            .await
            .map_err(TxmError::Persist)?;

        info!(
            "Queued transaction {} for {:?} (sequence {}).",
            tx.id, account, sequence
        );
        Ok(tx)
    }

    async fn submission_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        _alive: AliveGuard,
    ) {
        let period = self.config.poll_interval;
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let mut cancel = shutdown.clone();
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.process_queued(&mut cancel).await {
                        error!("Submission tick failed: {}.", err);
                    }
                }
            }
        }
        debug!("Submission loop stopped.");
    }

    async fn confirmation_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        _alive: AliveGuard,
    ) {
        let period = self.config.poll_interval;
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.process_in_flight().await {
                        error!("Confirmation tick failed: {}.", err);
                    }
                }
            }
        }
        debug!("Confirmation loop stopped.");
    }

    /// Queued records are visited by (account, sequence). An account is
    /// skipped for the rest of the tick once a record of it fails or the
    /// account reaches its in-flight cap.
    #[tracing::instrument(level = "trace", skip_all, fields(chain_id = %self.chain_id))]
    async fn process_queued(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), TxmError> {
        let result = self.submit_queued(shutdown).await;

        let mut health = self.lock_health();
        health.submitter = match &result {
            Ok(true) => Some("broadcast retries exhausted".to_string()),
            Ok(false) => None,
            Err(err) => Some(err.to_string()),
        };
        result.map(|_| ())
    }

    /// Returns whether some record exhausted its retries.
    async fn submit_queued(&self, shutdown: &mut watch::Receiver<bool>) -> Result<bool, TxmError> {
        let queued = self
            .ledger
            .queued(&self.chain_id)
            .await
            .map_err(TxmError::Persist)?;
        if queued.is_empty() {
            return Ok(false);
        }

        let mut in_flight: HashMap<Address, usize> = HashMap::new();
        for tx in self
            .ledger
            .in_flight(&self.chain_id)
            .await
            .map_err(TxmError::Persist)?
        {
            *in_flight.entry(tx.account).or_default() += 1;
        }

        trace!("{} queued transaction(s).", queued.len());

        let mut blocked = HashSet::new();
        let mut exhausted = false;
        for tx in queued {
            if blocked.contains(&tx.account) {
                continue;
            }
            let count = in_flight.entry(tx.account).or_default();
            if *count >= self.config.max_in_flight {
                trace!("Account {:?} reached its in-flight cap.", tx.account);
                blocked.insert(tx.account);
                continue;
            }

            match self.submit(&tx, shutdown).await? {
                Submission::Broadcast => *count += 1,
                Submission::Failed => {
                    blocked.insert(tx.account);
                }
                Submission::Exhausted => {
                    exhausted = true;
                    blocked.insert(tx.account);
                }
                Submission::Cancelled => {
                    debug!("Submission tick cancelled by shutdown.");
                    break;
                }
            }
        }
        Ok(exhausted)
    }

    async fn submit(
        &self,
        tx: &PendingTransaction,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Submission, TxmError> {
        let mut hint = None;
        let mut attempt = 0;
        loop {
            match self.try_broadcast(tx, hint).await {
                Ok((hash, gas)) => {
                    self.ledger
                        .mark_broadcast(tx.id, hash, gas)
                        .await
                        .map_err(TxmError::Persist)?;
                    info!(
                        "Broadcast transaction {} (sequence {}) => {:?}.",
                        tx.id, tx.sequence, hash
                    );
                    return Ok(Submission::Broadcast);
                }
                Err(AttemptError::Terminal(reason)) => {
                    self.release(tx, &reason).await?;
                    return Ok(Submission::Failed);
                }
                Err(AttemptError::Transient { reason, price }) => {
                    if price.is_some() {
                        hint = price;
                    }
                    if attempt >= self.config.max_retries {
                        error!(
                            "Giving up on transaction {} after {} attempt(s): {}.",
                            tx.id,
                            attempt + 1,
                            reason
                        );
                        self.release(tx, &reason).await?;
                        return Ok(Submission::Exhausted);
                    }

                    attempt += 1;
                    let delay = backoff(attempt, self.config.max_delay, MAX_BACKOFF);
                    warn!(
                        "Broadcast of transaction {} failed ({}), retry {} in {:?}.",
                        tx.id, reason, attempt, delay
                    );
                    if *shutdown.borrow() {
                        return Ok(Submission::Cancelled);
                    }
                    tokio::select! {
                        _ = self.config.time.sleep(delay) => {}
                        _ = shutdown.changed() => return Ok(Submission::Cancelled),
                    }
                }
            }
        }
    }

    async fn try_broadcast(
        &self,
        tx: &PendingTransaction,
        hint: Option<U256>,
    ) -> Result<(H256, GasQuote), AttemptError> {
        let gas = match self.estimator.get_legacy_gas(hint, tx.gas_limit).await {
            Ok(gas) => gas,
            Err(err @ GasEstimatorError::ZeroPrice) => {
                return Err(AttemptError::Transient {
                    reason: err.to_string(),
                    price: None,
                })
            }
            Err(err) => return Err(AttemptError::Terminal(err.to_string())),
        };

        let request = tx.to_legacy_transaction_request(self.network_id, &gas);
        let signed = self
            .signer
            .sign(tx.account, &request)
            .await
            .map_err(|err| AttemptError::Terminal(format!("signing: {:#}", err)))?;

        match self.client.broadcast(&signed).await {
            Ok(hash) => Ok((hash, gas)),
            Err(ClientError::Transient(reason)) => Err(AttemptError::Transient {
                reason,
                price: Some(gas.price),
            }),
            Err(ClientError::Rejected(reason)) => Err(AttemptError::Terminal(reason)),
        }
    }

    /// Transient read failures keep the record broadcast; the loop turns
    /// unhealthy after `max_retries` failing ticks in a row.
    #[tracing::instrument(level = "trace", skip_all, fields(chain_id = %self.chain_id))]
    async fn process_in_flight(&self) -> Result<(), TxmError> {
        let result = self.confirm_in_flight().await;

        let mut health = self.lock_health();
        let last_error = match &result {
            Ok(last_error) => last_error.clone(),
            Err(err) => Some(err.to_string()),
        };
        match last_error {
            Some(err) => {
                health.failing_confirmation_ticks += 1;
                if health.failing_confirmation_ticks >= self.config.max_retries.max(1) {
                    health.confirmer = Some(err);
                }
            }
            None => {
                health.failing_confirmation_ticks = 0;
                health.confirmer = None;
            }
        }
        result.map(|_| ())
    }

    /// Returns the last transient error of the tick, if any.
    async fn confirm_in_flight(&self) -> Result<Option<String>, TxmError> {
        let in_flight = self
            .ledger
            .in_flight(&self.chain_id)
            .await
            .map_err(TxmError::Persist)?;

        let mut last_error = None;
        for tx in in_flight {
            let hash = match tx.hash {
                Some(hash) => hash,
                None => {
                    self.fail(&tx, "broadcast record has no hash").await?;
                    continue;
                }
            };

            match self.client.finality(hash, self.config.confirmations).await {
                Ok(Finality::Finalized) => {
                    self.ledger
                        .mark_confirmed(tx.id)
                        .await
                        .map_err(TxmError::Persist)?;
                    self.broadcaster.publish(TxEvent::confirmed(&tx, hash));
                    info!("Transaction {} confirmed => {:?}.", tx.id, hash);
                }
                Ok(Finality::Pending) => {
                    trace!("Transaction {} is not final yet.", tx.id);
                }
                Ok(Finality::Rejected(reason)) | Err(ClientError::Rejected(reason)) => {
                    self.fail(&tx, &reason).await?;
                }
                Err(ClientError::Transient(reason)) => {
                    warn!("Could not check transaction {}: {}.", tx.id, reason);
                    last_error = Some(reason);
                }
            }
        }
        Ok(last_error)
    }

    async fn fail(&self, tx: &PendingTransaction, reason: &str) -> Result<(), TxmError> {
        self.ledger
            .mark_failed(tx.id, reason)
            .await
            .map_err(TxmError::Persist)?;
        self.broadcaster.publish(TxEvent::failed(tx, reason));
        warn!(
            "Transaction {} (sequence {}) failed: {}.",
            tx.id, tx.sequence, reason
        );
        Ok(())
    }

    /// Fails a record that never reached the network along with the later
    /// queued records of its account. Their sequences go back to the account,
    /// so the next enqueue fills the gap instead of queueing behind it.
    async fn release(&self, tx: &PendingTransaction, reason: &str) -> Result<(), TxmError> {
        let lock = self.locks.get(tx.account);
        let _guard = lock.lock().await;

        let failed = self
            .ledger
            .fail_queued(tx.id, reason)
            .await
            .map_err(TxmError::Persist)?;
        for record in &failed {
            let reason = record.error.as_deref().unwrap_or(reason);
            self.broadcaster.publish(TxEvent::failed(record, reason));
            warn!(
                "Transaction {} (sequence {}) failed: {}.",
                record.id, record.sequence, reason
            );
        }
        Ok(())
    }

    fn lock_health(&self) -> MutexGuard<'_, LoopHealth> {
        match self.health.lock() {
            Ok(health) => health,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Serializes sequence assignment per account. Locks nobody holds are
/// dropped on the next lookup.
#[derive(Debug, Default)]
struct AccountLocks {
    locks: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
}

impl AccountLocks {
    fn get(&self, account: Address) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.retain(|key, lock| *key == account || Arc::strong_count(lock) > 1);
        locks.entry(account).or_default().clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        match self.locks.lock() {
            Ok(locks) => locks.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Marks a loop as alive until dropped, even when its task is aborted.
#[derive(Debug)]
struct AliveGuard(Arc<AtomicBool>);

impl AliveGuard {
    fn new(flag: Arc<AtomicBool>) -> AliveGuard {
        flag.store(true, Ordering::SeqCst);
        AliveGuard(flag)
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
