use async_trait::async_trait;
use chain_txm::client::{ClientError, Finality, NetworkClient, Reader};
use chain_txm::signer::SignedTransaction;
use ethers::types::{Address, H256, U256};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
pub struct MockClientState {
    pub balance: Result<U256, ClientError>,
    pub gas_price: Result<U256, ClientError>,
    pub sequence: Result<u64, ClientError>,

    /// Consumed one per broadcast; `Ok` once empty.
    pub broadcast_outcomes: VecDeque<Result<(), ClientError>>,

    /// Consumed one per finality query; `finality` once empty.
    pub finality_outcomes: VecDeque<Result<Finality, ClientError>>,
    pub finality: Finality,

    /// Finality queries never answer.
    pub hang_finality: bool,

    pub broadcasts: Vec<SignedTransaction>,
    pub balance_n: usize,
    pub gas_price_n: usize,
    pub sequence_n: usize,
    pub broadcast_n: usize,
    pub finality_n: usize,
}

impl Default for MockClientState {
    fn default() -> Self {
        Self {
            balance: Ok(U256::zero()),
            gas_price: Ok(U256::zero()),
            sequence: Ok(0),
            broadcast_outcomes: VecDeque::new(),
            finality_outcomes: VecDeque::new(),
            finality: Finality::Finalized,
            hang_finality: false,
            broadcasts: Vec::new(),
            balance_n: 0,
            gas_price_n: 0,
            sequence_n: 0,
            broadcast_n: 0,
            finality_n: 0,
        }
    }
}

/// Scripted network client. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MockClient {
    state: Arc<Mutex<MockClientState>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockClientState> {
        self.state.lock().unwrap()
    }

    pub fn set_balance(&self, balance: u64) {
        self.state().balance = Ok(U256::from(balance));
    }

    pub fn set_gas_price(&self, gas_price: u64) {
        self.state().gas_price = Ok(U256::from(gas_price));
    }

    pub fn set_sequence(&self, sequence: u64) {
        self.state().sequence = Ok(sequence);
    }

    pub fn push_broadcast(&self, outcome: Result<(), ClientError>) {
        self.state().broadcast_outcomes.push_back(outcome);
    }

    pub fn push_finality(&self, outcome: Result<Finality, ClientError>) {
        self.state().finality_outcomes.push_back(outcome);
    }
}

#[async_trait]
impl Reader for MockClient {
    async fn balance_at(&self, _: Address) -> Result<U256, ClientError> {
        let mut state = self.state();
        state.balance_n += 1;
        state.balance.clone()
    }

    async fn gas_price(&self) -> Result<U256, ClientError> {
        let mut state = self.state();
        state.gas_price_n += 1;
        state.gas_price.clone()
    }

    async fn sequence_at(&self, _: Address) -> Result<u64, ClientError> {
        let mut state = self.state();
        state.sequence_n += 1;
        state.sequence.clone()
    }
}

#[async_trait]
impl NetworkClient for MockClient {
    async fn broadcast(&self, tx: &SignedTransaction) -> Result<H256, ClientError> {
        let mut state = self.state();
        state.broadcast_n += 1;
        state.broadcast_outcomes.pop_front().unwrap_or(Ok(()))?;
        state.broadcasts.push(tx.clone());
        Ok(tx.hash)
    }

    async fn finality(&self, _: H256, _: u64) -> Result<Finality, ClientError> {
        let outcome = {
            let mut state = self.state();
            state.finality_n += 1;
            if state.hang_finality {
                None
            } else {
                Some(match state.finality_outcomes.pop_front() {
                    Some(outcome) => outcome,
                    None => Ok(state.finality.clone()),
                })
            }
        };
        match outcome {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }
}
