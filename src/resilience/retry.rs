use tokio::time::{sleep, Duration};
use tracing::{error, warn};

use crate::errors::UpstreamError;

/// Retry policy for exchange calls. Only transport-class failures are
/// retried; service errors are a definitive answer and go straight back to
/// the caller.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub attempts: u32,
    /// will be multiplied by 2 on every attempt until max_delay_ms
    pub base_delay_ms: u64,
    /// max delay for retrying
    /// invariant: >= base_delay_ms.
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        }
    }
}

impl RetrySettings {
    pub async fn run_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, UpstreamError>>,
    {
        let mut delay = self.base_delay_ms;

        for attempt in 1..=self.attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts && e.kind.is_retryable() => {
                    warn!("Attempt {attempt}/{} failed: {e}", self.attempts);
                    sleep(Duration::from_millis(delay)).await;
                    delay = (delay * 2).min(self.max_delay_ms);
                }
                Err(e) => {
                    error!("giving up after {attempt} attempt(s): {e}");
                    return Err(e);
                }
            }
        }
        unreachable!("Retry loop exhausted unexpectedly")
    }
}
