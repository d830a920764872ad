//! Generic retry policy shared by `HubClient` and `ArchiveFetcher`
//! (spec.md §7): "wrap process spawning with structured stdout
//! parsing, timeouts, and retries in a single place".

use std::thread;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff: BackoffKind,
}

#[derive(Debug, Clone, Copy)]
pub enum BackoffKind {
    Exponential,
    Linear,
}

impl RetryPolicy {
    /// Hub submissions: up to 3 attempts, exponential backoff from 10s.
    pub fn hub_submission() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(10),
            backoff: BackoffKind::Exponential,
        }
    }

    /// Archive downloads: up to 2 attempts, linear backoff from 5s.
    pub fn archive_download() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_secs(5),
            backoff: BackoffKind::Linear,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Exponential => self.initial_backoff * 2u32.pow(attempt.saturating_sub(1)),
            BackoffKind::Linear => self.initial_backoff * attempt.max(1),
        }
    }

    /// Runs `operation` up to `max_attempts` times. `is_transient`
    /// distinguishes retryable failures from ones that should
    /// surface immediately (§7: "authentication failures and
    /// 'package not found' are surfaced immediately"). `sleep` is
    /// injected so tests can run without real delays.
    pub fn run_with<T, E>(
        &self,
        is_transient: impl Fn(&E) -> bool,
        sleep: impl Fn(Duration),
        mut operation: impl FnMut(u32) -> Result<T, E>,
    ) -> Result<T, E> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_transient(&err) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, "retrying after transient failure");
                    sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Convenience wrapper using `std::thread::sleep` for production call sites.
    pub fn run<T, E>(&self, is_transient: impl Fn(&E) -> bool, operation: impl FnMut(u32) -> Result<T, E>) -> Result<T, E> {
        self.run_with(is_transient, thread::sleep, operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retries_transient_failures_up_to_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            backoff: BackoffKind::Exponential,
        };
        let calls = Cell::new(0);
        let result: Result<(), &str> = policy.run_with(
            |_: &&str| true,
            |_| {},
            |_attempt| {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("transient")
                } else {
                    Ok(())
                }
            },
        );
        assert!(result.is_ok());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn does_not_retry_non_transient_failures() {
        let policy = RetryPolicy::hub_submission();
        let calls = Cell::new(0);
        let result: Result<(), &str> = policy.run_with(
            |_: &&str| false,
            |_| {},
            |_attempt| {
                calls.set(calls.get() + 1);
                Err("auth failure")
            },
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            backoff: BackoffKind::Linear,
        };
        let calls = Cell::new(0);
        let result: Result<(), &str> = policy.run_with(
            |_: &&str| true,
            |_| {},
            |_attempt| {
                calls.set(calls.get() + 1);
                Err("always transient")
            },
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 2);
    }
}
