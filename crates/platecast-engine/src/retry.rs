use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::ProviderError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Blocks the calling thread. Swapped out in tests to count delays.
pub type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

pub fn thread_sleeper() -> Sleeper {
    Arc::new(thread::sleep)
}

/// Emitted before each inter-attempt delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNotice {
    pub label: String,
    /// The attempt that just failed, starting at 1.
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay: Duration,
    pub error: ProviderError,
}

/// Bounded retry with a fixed delay, only for rate-limit class failures.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    sleeper: Sleeper,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            sleeper: thread_sleeper(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn run<T>(
        &self,
        label: &str,
        notify: &mut dyn FnMut(&RetryNotice),
        mut op: impl FnMut(u32) -> Result<T, ProviderError>,
    ) -> Result<T, ProviderError> {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_rate_limited() && attempt < self.max_attempts => {
                    notify(&RetryNotice {
                        label: label.to_string(),
                        attempt,
                        max_attempts: self.max_attempts,
                        delay: self.delay,
                        error: err,
                    });
                    (self.sleeper)(self.delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn counting_sleeper() -> (Sleeper, Arc<std::sync::Mutex<Vec<Duration>>>) {
    let slept = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = slept.clone();
    let sleeper: Sleeper = Arc::new(move |delay| {
        if let Ok(mut rows) = sink.lock() {
            rows.push(delay);
        }
    });
    (sleeper, slept)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate_limited() -> ProviderError {
        ProviderError::RateLimited {
            provider: "siliconflow".to_string(),
            status: Some(429),
            message: "slow down".to_string(),
        }
    }

    #[test]
    fn succeeds_on_third_attempt_after_two_delays() {
        let (sleeper, slept) = counting_sleeper();
        let policy = RetryPolicy::default().with_sleeper(sleeper);
        let mut notices = Vec::new();
        let mut calls = 0;
        let result = policy.run("vision", &mut |notice| notices.push(notice.clone()), |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(rate_limited())
            } else {
                Ok(format!("attempt-{attempt}"))
            }
        });

        assert_eq!(result, Ok("attempt-3".to_string()));
        assert_eq!(calls, 3);
        assert_eq!(
            *slept.lock().unwrap(),
            vec![Duration::from_secs(3), Duration::from_secs(3)]
        );
        assert_eq!(
            notices.iter().map(|notice| notice.attempt).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(notices.iter().all(|notice| notice.label == "vision"));
    }

    #[test]
    fn non_rate_limit_errors_are_not_retried() {
        let (sleeper, slept) = counting_sleeper();
        let policy = RetryPolicy::default().with_sleeper(sleeper);
        let mut calls = 0;
        let result: Result<(), ProviderError> = policy.run("copy", &mut |_| {}, |_| {
            calls += 1;
            Err(ProviderError::ContentPolicy {
                provider: "deepseek".to_string(),
                message: "no".to_string(),
            })
        });

        assert_eq!(result.unwrap_err().kind(), "content_policy");
        assert_eq!(calls, 1);
        assert!(slept.lock().unwrap().is_empty());
    }

    #[test]
    fn exhaustion_returns_last_error() {
        let (sleeper, slept) = counting_sleeper();
        let policy = RetryPolicy::new(3, Duration::from_millis(5)).with_sleeper(sleeper);
        let mut calls = 0;
        let result: Result<(), ProviderError> = policy.run("image", &mut |_| {}, |_| {
            calls += 1;
            Err(rate_limited())
        });

        assert!(result.unwrap_err().is_rate_limited());
        assert_eq!(calls, 3);
        assert_eq!(slept.lock().unwrap().len(), 2);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
        let result = policy.run("text", &mut |_| {}, |attempt| Ok::<u32, ProviderError>(attempt));
        assert_eq!(result, Ok(1));
    }
}
