use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

/// Longest pause between two broadcast attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Time: Debug + Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTime;

#[async_trait]
impl Time for DefaultTime {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Exponential backoff: `base × 2^(attempt-1)`, capped at `max`. Attempt 0
/// does not wait.
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = 2u32.saturating_pow(attempt - 1);
    base.checked_mul(factor).unwrap_or(max).min(max)
}
