use ethers::types::{Address, H256};
use serde::Serialize;
use std::fmt::Debug;
use tokio::sync::broadcast;
use tracing::trace;

use crate::transaction::{PendingTransaction, TxId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TxEventKind {
    Confirmed { hash: H256 },
    Failed { reason: String },
}

/// Published whenever a transaction record reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxEvent {
    pub chain_id: String,
    pub transaction_id: TxId,
    pub account: Address,
    pub sequence: u64,
    #[serde(flatten)]
    pub kind: TxEventKind,
}

impl TxEvent {
    pub fn confirmed(tx: &PendingTransaction, hash: H256) -> TxEvent {
        TxEvent::new(tx, TxEventKind::Confirmed { hash })
    }

    pub fn failed(tx: &PendingTransaction, reason: &str) -> TxEvent {
        TxEvent::new(
            tx,
            TxEventKind::Failed {
                reason: reason.to_string(),
            },
        )
    }

    fn new(tx: &PendingTransaction, kind: TxEventKind) -> TxEvent {
        TxEvent {
            chain_id: tx.chain_id.clone(),
            transaction_id: tx.id,
            account: tx.account,
            sequence: tx.sequence,
            kind,
        }
    }
}

/// Fire-and-forget notification of in-process subscribers.
pub trait EventBroadcaster: Debug + Send + Sync {
    fn publish(&self, event: TxEvent);
}

/// Fans events out over a bounded broadcast channel. Slow subscribers lose
/// the oldest events.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<TxEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> ChannelBroadcaster {
        let (sender, _) = broadcast::channel(capacity);
        ChannelBroadcaster { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.sender.subscribe()
    }
}

impl EventBroadcaster for ChannelBroadcaster {
    fn publish(&self, event: TxEvent) {
        if self.sender.send(event).is_err() {
            trace!("No subscribers for transaction events.");
        }
    }
}
