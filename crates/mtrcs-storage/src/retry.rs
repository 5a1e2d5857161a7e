//! Bounded retry for database calls that fail on a broken connection.

use std::future::Future;
use std::time::Duration;

use sea_orm::sqlx;
use sea_orm::{DbErr, RuntimeErr};

/// Fixed backoff schedule: up to three attempts, sleeping 1s then 3s between
/// them. The third delay only applies when a policy allows a fourth attempt.
const DEFAULT_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(3),
    Duration::from_secs(5),
];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_DELAYS.len(),
            delays: DEFAULT_DELAYS.to_vec(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Runs `op` until it succeeds, fails with an error `is_transient` rejects,
    /// or the attempt budget is spent. The last error is returned as-is.
    pub async fn run<T, E, F, Fut>(&self, is_transient: impl Fn(&E) -> bool, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_transient(&err) => {
                    let delay = self
                        .delays
                        .get(attempt - 1)
                        .or(self.delays.last())
                        .copied()
                        .unwrap_or_default();
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient database error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Classifies a database error as a connection-level failure.
///
/// Covers pool exhaustion, dropped sockets and PostgreSQL SQLSTATE class `08`
/// (connection exception). Constraint violations, syntax errors and decode
/// failures are not retried.
pub fn is_connection_error(err: &DbErr) -> bool {
    match err {
        DbErr::ConnectionAcquire(_) => true,
        DbErr::Conn(RuntimeErr::SqlxError(e))
        | DbErr::Exec(RuntimeErr::SqlxError(e))
        | DbErr::Query(RuntimeErr::SqlxError(e)) => is_sqlx_connection_error(e),
        DbErr::Conn(_) => true,
        _ => false,
    }
}

fn is_sqlx_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db.code().is_some_and(|code| code.starts_with("08")),
        _ => false,
    }
}
