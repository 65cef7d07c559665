//! Retry with exponential backoff and jitter.

use crate::config::IngestConfig;
use crate::error::{Error, Result};
use log::{info, warn};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first one
    pub max_attempts: usize,
    /// Scale each delay by a random factor in `[0.5, 1.0]`
    pub jitter: bool,
}

impl RetryConfig {
    /// Ingest transfers: few attempts, backoff long enough for an upload
    /// still in progress to finish
    pub fn ingest(config: &IngestConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            factor: 2.0,
            max_attempts: config.max_attempts.max(1),
            jitter: true,
        }
    }

    /// Device listing calls while probing
    pub fn device(attempts: usize) -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_attempts: attempts.max(1),
            jitter: true,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_attempts: 3,
            jitter: false,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let base = self
            .initial_delay
            .mul_f64(self.factor.powi(exponent))
            .min(self.max_delay);

        if self.jitter {
            base.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            base
        }
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the attempt budget is spent.
pub async fn retry<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: impl Fn(&Error) -> bool,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(
                        "Operation '{}' succeeded after {} attempts",
                        operation_name, attempt
                    );
                }
                return Ok(val);
            }
            Err(err) => {
                if attempt >= config.max_attempts || !should_retry(&err) {
                    return Err(err);
                }

                let delay = config.delay_after(attempt);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempt, config.max_attempts, err, delay
                );
                sleep(delay).await;
            }
        }
    }
}
