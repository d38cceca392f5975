//! Bounded local retry for transient failures.

use tracing::warn;

use super::config::RetryPolicy;
use crate::error::{Error, Result};

/// Run `op` until it succeeds, fails permanently, or the retry budget is
/// spent.
///
/// Only errors for which [`Error::is_transient`] holds are retried; once the
/// budget is exhausted they surface as [`Error::StorageUnavailable`].
/// Everything else is returned unmodified on the first failure.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt >= max_attempts {
                    return Err(Error::StorageUnavailable {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                let delay = policy.backoff_for(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient storage failure, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionId;
    use std::time::Duration;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .max_attempts(attempts)
            .initial_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(2))
    }

    fn timeout() -> Error {
        Error::LockTimeout {
            partition: PartitionId(1),
        }
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let mut calls = 0;
        let result = with_retry(&fast_policy(3), "test", || {
            calls += 1;
            if calls < 3 {
                Err(timeout())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_exhausted_budget_is_unavailable() {
        let mut calls = 0;
        let result: Result<()> = with_retry(&fast_policy(2), "test", || {
            calls += 1;
            Err(timeout())
        });
        assert_eq!(calls, 2);
        assert!(matches!(
            result,
            Err(Error::StorageUnavailable { attempts: 2, .. })
        ));
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<()> = with_retry(&fast_policy(5), "test", || {
            calls += 1;
            Err(Error::MissingTenantScope)
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(Error::MissingTenantScope)));
    }
}
