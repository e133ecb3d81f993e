use async_trait::async_trait;
use chain_txm::time::Time;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Never sleeps. Counts the sleeps it was asked for.
#[derive(Clone, Debug, Default)]
pub struct MockTime {
    sleep_n: Arc<AtomicUsize>,
}

impl MockTime {
    pub fn sleep_n(&self) -> usize {
        self.sleep_n.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Time for MockTime {
    async fn sleep(&self, _: Duration) {
        self.sleep_n.fetch_add(1, Ordering::SeqCst);
    }
}

/// Never wakes up. Counts the sleeps it was asked for.
#[derive(Clone, Debug, Default)]
pub struct BlockingTime {
    sleep_n: Arc<AtomicUsize>,
}

impl BlockingTime {
    pub fn sleep_n(&self) -> usize {
        self.sleep_n.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Time for BlockingTime {
    async fn sleep(&self, _: Duration) {
        self.sleep_n.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
    }
}
