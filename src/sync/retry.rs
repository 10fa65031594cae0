//! Bounded retry for read calls.
//!
//! Writes are never retried; only the three list calls go through here.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Delay before attempt `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Why a retried read produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    Cancelled,
    Failed(RemoteError),
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }

    /// Runs `op` until it succeeds, fails terminally, runs out of attempts,
    /// or `cancel` fires. Cancellation also interrupts a backoff sleep.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ReadFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.delay_before(attempt);
                log::debug!("[RETRY] {} attempt #{} in {:?}", label, attempt + 1, delay);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ReadFailure::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ReadFailure::Cancelled),
                r = op() => r,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_terminal() => {
                    log::warn!("[RETRY] {} failed terminally: {}", label, e);
                    return Err(ReadFailure::Failed(e));
                }
                Err(e) => {
                    log::warn!("[RETRY] {} attempt #{} failed: {}", label, attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }

        Err(ReadFailure::Failed(last_err.unwrap_or_else(|| {
            RemoteError::Transport(format!("{label}: no attempt made"))
        })))
    }
}
