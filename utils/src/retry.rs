//! A small bounded retry helper for operations that can fail transiently.

use std::time::Duration;

use anyhow::Result;

/// Bounded retry with a fixed delay, applied only to errors accepted by
/// the `retryable` predicate. Anything else propagates on first sight.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Sleep between attempts.
    pub delay: Duration,
    /// Classifies an error as transient.
    pub retryable: fn(&anyhow::Error) -> bool,
}

impl RetryPolicy {
    /// A policy which never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
            retryable: |_| false,
        }
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is exhausted; in the latter case the last error is returned.
    pub fn run<T>(&self, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts && (self.retryable)(&e) => {
                    tracing::debug!("Caught transient error (attempt {attempt}/{attempts}): {e:#}");
                    attempt += 1;
                    if !self.delay.is_zero() {
                        std::thread::sleep(self.delay);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    static_assertions::assert_impl_all!(RetryPolicy: Send, Sync, Copy);

    fn is_flaky(e: &anyhow::Error) -> bool {
        e.to_string().contains("502")
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::ZERO,
            retryable: is_flaky,
        }
    }

    #[test]
    fn test_retry_until_success() {
        let calls = Cell::new(0);
        let r = policy(10).run(|| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                anyhow::bail!("proxy said 502");
            }
            Ok(calls.get())
        });
        assert_eq!(r.unwrap(), 3);
    }

    #[test]
    fn test_retry_exhausted() {
        let calls = Cell::new(0);
        let r: Result<()> = policy(4).run(|| {
            calls.set(calls.get() + 1);
            anyhow::bail!("proxy said 502 on call {}", calls.get())
        });
        assert_eq!(calls.get(), 4);
        assert!(r.unwrap_err().to_string().contains("call 4"));
    }

    #[test]
    fn test_no_retry_on_other_errors() {
        let calls = Cell::new(0);
        let r: Result<()> = policy(10).run(|| {
            calls.set(calls.get() + 1);
            anyhow::bail!("not found")
        });
        assert!(r.is_err());
        assert_eq!(calls.get(), 1);
        let calls = Cell::new(0);
        let r: Result<()> = RetryPolicy::none().run(|| {
            calls.set(calls.get() + 1);
            anyhow::bail!("502")
        });
        assert!(r.is_err());
        assert_eq!(calls.get(), 1);
    }
}
