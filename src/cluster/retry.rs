//! Bounded retry on transport timeouts.
//!
//! Resharding and node removal run for a long time against many nodes; a
//! single socket timeout should not abandon the whole operation. Every
//! retried timeout is appended to the caller's attempts sink.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::Attempt;
use crate::error::Result;

/// How often and how patiently to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before the last timeout is returned.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Set the attempt bound.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the pause between attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Run `op` until it succeeds, fails with a non-timeout error, or
/// `policy.max_attempts` timeouts have been seen.
///
/// Each timeout is recorded in `attempts` before sleeping.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    attempts: &mut Vec<Attempt>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tries: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_timeout() => {
                tries += 1;
                attempts.push(Attempt::TimedOut {
                    operation: operation.to_string(),
                    message: e.to_string(),
                });
                if tries >= policy.max_attempts {
                    return Err(e);
                }
                warn!(
                    operation,
                    attempt = tries,
                    backoff = ?policy.backoff,
                    error = %e,
                    "Timeout, trying again"
                );
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}
