use chain_txm::events::{EventBroadcaster, TxEvent};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MockBroadcaster {
    events: Mutex<Vec<TxEvent>>,
}

impl MockBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TxEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventBroadcaster for MockBroadcaster {
    fn publish(&self, event: TxEvent) {
        self.events.lock().unwrap().push(event);
    }
}
