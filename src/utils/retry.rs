use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

// ============================================================================
// Exponential Backoff Retry
// ============================================================================
//
// Used for outbound deliveries (bounded attempts, transient errors only) and
// for endpoint-store lookups (unbounded, paced by `Backoff`).
//
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            max: self.max_delay,
            multiplier: self.multiplier,
        }
    }
}

/// Delay sequence that grows geometrically up to a ceiling.
#[derive(Clone, Debug)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next.min(self.max);
        let grown = (current.as_millis() as f64 * self.multiplier) as u64;
        self.next = Duration::from_millis(grown).min(self.max);
        current
    }

    pub fn reset(&mut self, initial: Duration) {
        self.next = initial;
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success { value: T, attempts: u32 },
    /// Every allowed attempt failed with a transient error
    Exhausted { error: E, attempts: u32 },
    /// A non-transient error stopped retrying early
    PermanentFailure { error: E, attempts: u32 },
}

/// Decides whether an error is worth another attempt
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
pub async fn retry_on_transient<F, Fut, T, E>(
    config: &RetryConfig,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    let max_attempts = config.max_attempts.max(1);
    let mut backoff = config.backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt = attempt, "Operation succeeded after retry");
                }
                return RetryResult::Success { value, attempts: attempt };
            }
            Err(error) if !error.is_transient() => {
                tracing::debug!(
                    attempt = attempt,
                    error = %error,
                    "Permanent failure detected, not retrying"
                );
                return RetryResult::PermanentFailure { error, attempts: attempt };
            }
            Err(error) if attempt >= max_attempts => {
                return RetryResult::Exhausted { error, attempts: attempt };
            }
            Err(error) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying after delay"
                );
                sleep(delay).await;
            }
        }
    }
}
