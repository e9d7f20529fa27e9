//! Retry-with-backoff, circuit breaker and bounded-timeout primitives used
//! by the remote loader (and available to domain bridges for their own
//! retry policies on event/workflow candidates).

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

/// Exponential backoff with optional jitter, bounded by `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before the given zero-indexed retry attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(20);
        let scaled = self.base_delay.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
        let capped = scaled.min(self.max_delay);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let mut rng = rand::thread_rng();
        let jittered_millis = rng.gen_range(0..=capped.as_millis().max(1) as u64);
        Duration::from_millis(jittered_millis)
    }

    /// Run `operation` up to `attempts` times, sleeping `delay_for` between
    /// tries, retrying only while `is_retriable` returns true for the error.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        is_retriable: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < self.attempts && is_retriable(&err) => {
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<std::time::Instant>,
}

/// A consecutive-failure circuit breaker. `Open` short-circuits calls until
/// `reset_timeout` elapses, at which point a single probe is allowed through
/// (`HalfOpen`); its outcome decides whether the breaker closes or re-opens.
pub struct CircuitBreaker {
    policy: CircuitBreakerPolicy,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed right now. Transitions `Open` to
    /// `HalfOpen` once the reset timeout has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => true,
            State::HalfOpen => true,
            State::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.policy.reset_timeout {
                    inner.state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        if inner.state == State::HalfOpen || inner.consecutive_failures >= self.policy.failure_threshold {
            inner.state = State::Open;
            inner.opened_at = Some(std::time::Instant::now());
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner.lock().state, State::Open)
    }
}

/// Run `fut` with a bounded timeout, mapping elapsed time to `on_timeout`.
pub async fn with_timeout<T, E>(
    duration: Duration,
    fut: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce() -> E,
) -> Result<T, E> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_for_is_bounded_by_max_delay() {
        let policy = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn run_retries_until_success() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        };
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = policy
            .run(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { if n < 2 { Err("transient") } else { Ok(42) } }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn breaker_opens_after_threshold_and_resets() {
        let breaker = CircuitBreaker::new(CircuitBreakerPolicy {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(0),
        });
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(breaker.is_open());
        // reset_timeout is zero, so the next `allow` flips to half-open.
        assert!(breaker.allow());
        breaker.record_success();
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn with_timeout_maps_elapsed_future() {
        let result: Result<(), &str> = with_timeout(
            Duration::from_millis(5),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            || "timed out",
        )
        .await;
        assert_eq!(result, Err("timed out"));
    }
}
