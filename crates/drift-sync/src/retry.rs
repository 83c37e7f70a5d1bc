//! Exponential backoff for transient repository failures.

use std::future::Future;
use std::time::Duration;

use drift_repo::RepoError;
use drift_types::SyncConfig;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::SyncError;

/// How often and how patiently to retry a repository call.
///
/// Only [`RepoError::Transient`] is retried. Delays double from
/// `base_delay` up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails non-transiently, runs out of
    /// retries, or `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancelToken,
        mut op: F,
    ) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepoError>>,
    {
        let mut retries = 0;
        loop {
            cancel.check()?;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                result = op() => result,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retries < self.max_retries => {
                    retries += 1;
                    let delay = self.delay_for(retries);
                    warn!(
                        what,
                        retry = retries,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient repository failure, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    return Err(SyncError::RetriesExhausted {
                        what: what.to_string(),
                        attempts: retries + 1,
                        source: e,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
