use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub const fn exponential(attempts: u32, base: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Exponential {
                base,
                max: Duration::from_secs(60),
            },
        }
    }

    /// Immediate retries, for tests.
    pub const fn immediate(attempts: u32) -> Self {
        Self::fixed(attempts, Duration::ZERO)
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Store writes: 3 attempts, one second apart.
pub const STORE: RetryPolicy = RetryPolicy::fixed(3, Duration::from_secs(1));
/// Outbound HTTP and AWS calls.
pub const NETWORK: RetryPolicy = RetryPolicy::exponential(3, Duration::from_secs(1));
/// Ready-to-start handling, which waits for kubelet to catch up.
pub const READY_TO_START: RetryPolicy = RetryPolicy::fixed(5, Duration::from_secs(2));

/// Run `op` until it succeeds, the policy is exhausted, or `is_retryable`
/// rejects the error. The last error is returned.
pub async fn retry_async<T, E, F, Fut, R>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
    is_retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt >= attempts || !is_retryable(&e) {
                    return Err(e);
                }
                let delay = policy.delay_after(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    what, attempt, attempts, e, delay
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

pub fn always<E>(_: &E) -> bool {
    true
}
