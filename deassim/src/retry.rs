//! Retry policy for filesystem calls against the two NFS backends.
//!
//! Call sites hand the policy a closure producing the I/O future; the policy
//! classifies each failure with [`FailureKind`] and decides whether another
//! attempt is made. Only kinds listed in `retryable` are retried.

use crate::error::{DeassimError, DeassimResult, FailureKind};
use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    retryable: HashSet<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(5), 2.0)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            multiplier: if multiplier < 1.0 { 1.0 } else { multiplier },
            retryable: HashSet::from([FailureKind::Transient]),
        }
    }

    /// Single attempt, never retries
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_retry(&self, kind: FailureKind, attempt: u32) -> bool {
        attempt < self.max_attempts && self.retryable.contains(&kind)
    }

    /// Backoff before attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_backoff.mul_f64(factor);
        delay.min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails with a non-retryable kind, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, op: &str, path: &Path, mut f: F) -> DeassimResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} on {:?} succeeded after {} attempts", op, path, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let kind = FailureKind::classify(&e);
                    if !self.should_retry(kind, attempt) {
                        return Err(DeassimError::from_io(path, e));
                    }
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} on {:?} failed ({}), retrying in {:?} (attempt {}/{})",
                        op, path, e, delay, attempt, self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
