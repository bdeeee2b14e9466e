//! Bounded retry policy for transient connectivity failures.
//!
//! Attempt 1 fails → short delay, retry as-is. After `recover_after`
//! consecutive retryable failures the caller-supplied recovery hook runs
//! (pool rebuild, reconnect) and the longer delay applies. Non-retryable
//! errors and the final attempt's error propagate unchanged.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before retrying a single blip.
    pub short_delay: Duration,
    /// Delay after recovery has been triggered.
    pub long_delay: Duration,
    /// Consecutive retryable failures before the recovery hook runs.
    pub recover_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            short_delay: Duration::from_millis(100),
            long_delay: Duration::from_millis(1000),
            recover_after: 2,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Run `op` under the policy.
    ///
    /// `op` receives the 1-based attempt number. `recover` runs at most once
    /// per retry once the consecutive-failure threshold is reached; if it
    /// fails, its error is logged and the retry proceeds anyway so the final
    /// attempt's error is what surfaces.
    pub async fn run<T, Op, Fut, Rec, RecFut>(
        &self,
        label: &str,
        mut op: Op,
        mut recover: Rec,
    ) -> Result<T>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        Rec: FnMut() -> RecFut,
        RecFut: Future<Output = Result<()>>,
    {
        let mut consecutive = 0u32;
        let mut attempt = 1u32;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.max_attempts {
                return Err(err);
            }

            consecutive += 1;
            let delay = if consecutive >= self.recover_after {
                warn!(
                    resource = label,
                    attempt,
                    error = %err,
                    "repeated connectivity failure, recovering"
                );
                if let Err(rec_err) = recover().await {
                    warn!(resource = label, error = %rec_err, "recovery failed");
                }
                self.long_delay
            } else {
                warn!(resource = label, attempt, error = %err, "connectivity failure, retrying");
                self.short_delay
            };

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
