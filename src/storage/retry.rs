/// Bounded retry for SQLite write contention
///
/// Only "database is busy/locked" failures are retried; everything else is
/// returned on the first attempt.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Exponential backoff policy for busy/locked storage errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubled after each further one
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Run `operation` until it succeeds, fails with a non-busy error, or
    /// the attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut backoff = self.initial_backoff;
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) => {
                    if attempt >= self.max_attempts {
                        return Err(Error::TransientStorage(format!(
                            "still busy after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    tracing::debug!(
                        "🔒 Database busy (attempt {}/{}), retrying in {:?}",
                        attempt,
                        self.max_attempts,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(Error::Storage(e)),
            }
        }
    }
}

/// Whether an sqlx error is SQLite lock contention.
pub fn is_busy(error: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_error) = error else {
        return false;
    };

    // Extended result codes keep the primary code in the low byte.
    if let Some(code) = db_error.code().and_then(|c| c.parse::<i32>().ok()) {
        let primary = code & 0xff;
        if primary == 5 || primary == 6 {
            return true;
        }
    }

    let message = db_error.message();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("busy")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct FakeDbError {
        code: &'static str,
        message: &'static str,
    }

    impl std::fmt::Display for FakeDbError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.message)
        }
    }

    impl std::error::Error for FakeDbError {}

    impl sqlx::error::DatabaseError for FakeDbError {
        fn message(&self) -> &str {
            self.message
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.code))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn busy() -> sqlx::Error {
        sqlx::Error::Database(Box::new(FakeDbError {
            code: "5",
            message: "database is locked",
        }))
    }

    fn constraint() -> sqlx::Error {
        sqlx::Error::Database(Box::new(FakeDbError {
            code: "1555",
            message: "UNIQUE constraint failed",
        }))
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn classifies_busy_and_locked_codes() {
        assert!(is_busy(&busy()));
        assert!(is_busy(&sqlx::Error::Database(Box::new(FakeDbError {
            code: "517",
            message: "snapshot",
        }))));
        assert!(is_busy(&sqlx::Error::Database(Box::new(FakeDbError {
            code: "6",
            message: "locked",
        }))));
        assert!(!is_busy(&constraint()));
        assert!(!is_busy(&sqlx::Error::RowNotFound));
    }

    #[tokio::test]
    async fn retries_busy_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(busy()) } else { Ok(n) } }
            })
            .await
            .unwrap();

        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(busy()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TransientStorage(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast()
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(constraint()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
