use std::future::Future;
use std::time::Duration;

use rand::Rng;

use aircheck_common::config::RetryConfig;

use super::{Db, DbError};

/// Error-text markers that indicate a transient failure worth retrying.
const RETRYABLE_MARKERS: &[&str] = &[
    "deadlock detected",
    "lock timeout",
    "lock_timeout",
    "could not serialize access",
    "concurrent update",
    "connection reset",
    "connection timed out",
    "server closed the connection",
];

/// Error-text markers that indicate a permanent failure; retrying is wasted work.
const FATAL_MARKERS: &[&str] = &[
    "syntax error",
    "does not exist",
    "permission denied",
    "authentication failed",
];

const DEADLOCK_MARKERS: &[&str] = &[
    "deadlock detected",
    "could not serialize access",
    "concurrent update",
];

/// Deadlock retries are capped well below the general backoff ceiling so a
/// contended transaction re-runs quickly once the conflicting lock clears.
const DEADLOCK_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Classify an error message as retryable. Fatal markers win over retryable
/// ones; messages matching neither are not retried.
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    if FATAL_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }
    RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
}

pub fn is_deadlock_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    DEADLOCK_MARKERS.iter().any(|m| lower.contains(m))
}

/// Whether the whole operation may be retried. Operational failures
/// (pool, connection, watchdog abort) retry by default; query errors retry
/// only when their text matches a known transient condition.
pub fn is_retryable(err: &DbError) -> bool {
    match err {
        DbError::Connection(_) | DbError::PoolExhausted(_) | DbError::TxAborted(_) => true,
        DbError::Query(msg) => is_retryable_message(msg),
        DbError::Conflict(_) | DbError::NotFound(_) | DbError::Migration(_) => false,
    }
}

pub fn is_deadlock(err: &DbError) -> bool {
    match err {
        DbError::Query(msg) | DbError::Connection(msg) => is_deadlock_message(msg),
        _ => false,
    }
}

/// Exponential backoff for general transient failures.
pub fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exp = cfg.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
    let base = (cfg.initial_backoff_ms as f64 * exp).min(cfg.max_backoff_ms as f64);
    let jitter = if cfg.jitter {
        rand::rng().random_range(0.0..100.0)
    } else {
        0.0
    };
    Duration::from_millis((base + jitter) as u64)
}

/// Jittered exponential backoff for deadlock retries, capped at 5s.
pub fn deadlock_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(100 * 2u64.saturating_pow(attempt));
    let jitter = Duration::from_millis(rand::rng().random_range(0..100));
    (base + jitter).min(DEADLOCK_BACKOFF_CAP)
}

impl Db {
    /// Retry `op` on transient persistence failures with exponential backoff
    /// and jitter. Deadlocks get the shorter deadlock backoff and are
    /// counted separately. Non-retryable errors surface immediately.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        label: &str,
        max_attempts: u32,
        mut op: F,
    ) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let max_attempts = max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    self.record_error(label, &e);

                    if !is_retryable(&e) {
                        tracing::error!(context = label, error = %e, "Non-retryable error");
                        return Err(e);
                    }

                    // A closed pool never recovers on its own.
                    if matches!(e, DbError::Connection(_)) && self.pool().is_closed() {
                        if let Err(re) = self.recreate_pool().await {
                            tracing::error!(context = label, error = %re, "Pool recreation failed");
                        }
                    }

                    if attempt == max_attempts {
                        tracing::error!(
                            context = label,
                            attempts = max_attempts,
                            error = %e,
                            "Operation failed after all retry attempts"
                        );
                        return Err(e);
                    }

                    let delay = if is_deadlock(&e) {
                        self.note_deadlock();
                        deadlock_delay(attempt)
                    } else {
                        backoff_delay(self.retry_config(), attempt)
                    };

                    tracing::warn!(
                        context = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient error, retrying"
                    );
                    self.note_retry();
                    tokio::time::sleep(delay).await;
                }
            }
        }

        unreachable!("retry loop always returns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadlock_is_retryable() {
        assert!(is_retryable_message(
            "ERROR: deadlock detected: process 42 waits for ShareLock"
        ));
        assert!(is_retryable_message("could not serialize access due to concurrent update"));
        assert!(is_retryable_message("server closed the connection unexpectedly"));
    }

    #[test]
    fn test_fatal_errors_are_not_retryable() {
        assert!(!is_retryable_message("syntax error at or near \"SELEC\""));
        assert!(!is_retryable_message("column \"loda\" does not exist"));
        assert!(!is_retryable_message("permission denied for table streams"));
        // Fatal markers win even if a retryable marker also matches.
        assert!(!is_retryable_message(
            "permission denied while recovering from deadlock detected"
        ));
    }

    #[test]
    fn test_unknown_errors_are_not_retryable() {
        assert!(!is_retryable_message("division by zero"));
    }

    #[test]
    fn test_error_kind_classification() {
        assert!(is_retryable(&DbError::PoolExhausted("timed out".into())));
        assert!(is_retryable(&DbError::TxAborted("watchdog".into())));
        assert!(!is_retryable(&DbError::Conflict("duplicate key".into())));
        assert!(!is_retryable(&DbError::Query("bad things".into())));
        assert!(is_retryable(&DbError::Query("lock timeout".into())));
    }

    #[test]
    fn test_deadlock_delay_is_capped() {
        for attempt in 0..20 {
            assert!(deadlock_delay(attempt) <= DEADLOCK_BACKOFF_CAP);
        }
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let cfg = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&cfg, 10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_backoff_jitter_stays_in_bounds() {
        let cfg = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: true,
        };

        for _ in 0..50 {
            let d = backoff_delay(&cfg, 1);
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(200));
        }
    }
}
