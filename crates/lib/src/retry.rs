//! Explicit per-call retry policy.
//!
//! The gateway never retries on its own. Callers that want retries pass a
//! [`RetryPolicy`]; only [`ClientError::Network`] is retried, so `Unauthorized`
//! and `Api` errors surface on the first attempt.

use std::future::Future;
use std::time::Duration;

use crate::error::ClientError;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed(Duration),
    /// `min(initial * 2^(n-1), max)` for the n-th retry.
    Exponential { initial: Duration, max: Duration },
}

impl Backoff {
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Backoff::Exponential { initial, max }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { initial, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                initial.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

/// `{ max_attempts, backoff }`, retryable on network errors only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. 0 is treated as 1.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Single attempt. Used for uploads and deletes, whose idempotency cannot be assumed.
    pub fn none() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < max => {
                    let delay = self.backoff.delay(attempt);
                    log::debug!(
                        "attempt {}/{} failed ({}), retrying in {:?}",
                        attempt,
                        max,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, `min(1s * 2^n, 30s)`.
    fn default() -> Self {
        Self::new(
            3,
            Backoff::exponential(Duration::from_secs(1), Duration::from_secs(30)),
        )
    }
}
