//! Retry policy: classification, exponential backoff, jitter.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use cascade_core::{EngineError, RetryConfig};

/// Wraps retryable invocations. Only `ApiCall` failures classify as
/// retryable today; everything else fails through on the first attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Backoff before retry number `attempt` (0-indexed). A `Retry-After`
    /// signal on the error replaces the computed backoff; both are capped
    /// at `maxDelayMs`.
    pub fn delay_for(&self, attempt: u32, error: &EngineError) -> Duration {
        let max_delay = Duration::from_millis(self.config.max_delay_ms);

        if let EngineError::Api {
            status: 429,
            retry_after_ms: Some(ms),
        } = error
        {
            return Duration::from_millis(*ms).min(max_delay);
        }

        let base = self.config.initial_delay_ms as f64
            * self.config.backoff_base.powi(attempt as i32);
        let mut delay = Duration::from_millis(base as u64).min(max_delay);
        if self.config.jitter {
            let jitter = rand::thread_rng().gen_range(0.0..=0.1) * delay.as_millis() as f64;
            delay += Duration::from_millis(jitter as u64);
        }
        delay.min(max_delay)
    }

    /// Run `operation` with retries. Terminal errors and exhausted budgets
    /// surface the last error; sleeps race the cancellation token.
    pub async fn run<F, Fut, T>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(name, attempt, "succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !error.is_retryable() || attempt >= self.config.max_retries {
                        if attempt > 0 {
                            warn!(name, attempt, %error, "giving up after retries");
                        }
                        return Err(error);
                    }
                    let delay = self.delay_for(attempt, &error);
                    warn!(
                        name,
                        attempt = attempt + 1,
                        max = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retrying after transient failure"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
