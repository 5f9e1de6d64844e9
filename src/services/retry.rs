//! Bounded retry with exponential backoff, shared by both provider orchestrators.

use crate::client::ProviderError;
use log::warn;
use rand::Rng;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra random delay of up to this fraction of the computed backoff.
    pub jitter: f64,
    pub retryable: fn(&ProviderError) -> bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: base_delay.saturating_mul(8),
            jitter: 0.2,
            retryable: ProviderError::is_transient,
        }
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based) just failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16));
        let capped = exp.min(self.max_delay);
        if self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter);
        capped + capped.mul_f64(extra)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, runs out of
    /// attempts, or the next backoff would end past `deadline`.
    pub fn run<T>(
        &self,
        label: &str,
        deadline: Instant,
        mut op: impl FnMut(u32) -> Result<T, ProviderError>,
    ) -> Result<T, RetryError> {
        let mut attempt = 0;
        loop {
            if Instant::now() >= deadline {
                return Err(RetryError::DeadlineExceeded { attempts: attempt });
            }
            attempt += 1;
            let err = match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !(self.retryable)(&err) {
                return Err(RetryError::Fatal(err));
            }
            if attempt >= self.max_attempts {
                return Err(RetryError::Exhausted { attempts: attempt, last: err });
            }
            let delay = self.backoff(attempt);
            if Instant::now() + delay >= deadline {
                return Err(RetryError::Exhausted { attempts: attempt, last: err });
            }
            warn!(
                "{}: attempt {}/{} failed ({}); retrying in {}ms",
                label,
                attempt,
                self.max_attempts,
                err,
                delay.as_millis()
            );
            thread::sleep(delay);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryError {
    /// Every allowed attempt failed with a transient error.
    Exhausted { attempts: u32, last: ProviderError },
    /// A non-transient error; not retried.
    Fatal(ProviderError),
    /// The cycle deadline passed before another attempt could start.
    DeadlineExceeded { attempts: u32 },
}

impl core::fmt::Display for RetryError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => write!(f, "gave up after {} attempt(s): {}", attempts, last),
            RetryError::Fatal(e) => write!(f, "not retryable: {}", e),
            RetryError::DeadlineExceeded { attempts } => {
                write!(f, "cycle deadline passed after {} attempt(s)", attempts)
            }
        }
    }
}

impl std::error::Error for RetryError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO)
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let mut calls = 0;
        let result = quick(3).run("test", far(), |attempt| {
            calls += 1;
            if attempt < 3 { Err(ProviderError::Timeout) } else { Ok("ok") }
        });
        assert_eq!(result, Ok("ok"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhaustion_reports_last_error() {
        let mut calls = 0;
        let result: Result<(), _> = quick(2).run("test", far(), |_| {
            calls += 1;
            Err(ProviderError::RateLimited)
        });
        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 2,
                last: ProviderError::RateLimited
            })
        );
        assert_eq!(calls, 2);
    }

    #[test]
    fn non_transient_errors_stop_immediately() {
        let mut calls = 0;
        let auth = ProviderError::Auth {
            status: 401,
            message: "bad key".into(),
        };
        let result: Result<(), _> = quick(5).run("test", far(), |_| {
            calls += 1;
            Err(auth.clone())
        });
        assert_eq!(result, Err(RetryError::Fatal(auth)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn passed_deadline_prevents_any_attempt() {
        let mut calls = 0;
        let result: Result<(), _> = quick(3).run("test", Instant::now(), |_| {
            calls += 1;
            Ok(())
        });
        assert_eq!(result, Err(RetryError::DeadlineExceeded { attempts: 0 }));
        assert_eq!(calls, 0);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut policy = RetryPolicy::new(6, Duration::from_millis(100));
        policy.jitter = 0.0;
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(800));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        for _ in 0..50 {
            let d = policy.backoff(1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(120), "{d:?}");
        }
    }
}
