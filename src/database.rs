//! Embedded SQLite connection management.
//!
//! One pool per process, shared by every deployed channel. Multi-statement
//! sequences run under per-message transactions opened by the store layer;
//! this module only owns pool construction, pragma application, and the
//! lock-retry helper.

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::EngineConfig;

/// Database-level errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Error from `SQLx`.
    #[error("database error: {source}")]
    Sqlx {
        /// Underlying driver error.
        #[from]
        source: sqlx::Error,
    },

    /// Pool construction failed.
    #[error("connection pool error: {message}")]
    ConnectionPool {
        /// What went wrong while building the pool.
        message: String,
    },
}

/// Database result type.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Connection with a managed pool, cheap to clone.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
    deadlock_retries: u32,
}

impl DatabaseConnection {
    /// Opens the pool and applies the engine pragmas.
    ///
    /// # Errors
    ///
    /// Returns an error when the pool cannot be built or a pragma fails.
    pub async fn initialize(config: &EngineConfig) -> DatabaseResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .pragma("journal_mode", "WAL")
            .pragma("foreign_keys", "ON")
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size.as_u32())
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::ConnectionPool {
                message: format!("failed to create connection pool: {e}"),
            })?;

        // NORMAL keeps WAL crash-safe while avoiding a full fsync per commit.
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        info!(path = %config.db_path.display(), pool_size = %config.pool_size, "database pool ready");

        Ok(Self {
            pool,
            deadlock_retries: config.deadlock_retries.as_u32(),
        })
    }

    /// The shared pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Configured retry budget for [`with_retry`].
    #[must_use]
    pub fn deadlock_retries(&self) -> u32 {
        self.deadlock_retries
    }

    /// Closes the pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Whether an error is a lock-wait/deadlock condition worth retrying.
#[must_use]
pub fn is_lock_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6).
            matches!(db.code().as_deref(), Some("5" | "6" | "517" | "262"))
                || db.message().contains("database is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Retries `operation` on lock-wait/deadlock errors with exponential
/// backoff, up to `retries` additional attempts.
///
/// # Errors
///
/// Returns the last error once the retry budget is exhausted, or the first
/// non-retryable error immediately.
pub async fn with_retry<T, F, Fut>(retries: u32, mut operation: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut backoff = Duration::from_millis(50);
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if is_lock_error(&error) && attempt < retries => {
                attempt += 1;
                warn!(attempt, backoff_ms = backoff.as_millis() as u64, "database locked, retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::message::ServerId;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn test_config(dir: &tempfile::TempDir) -> EngineConfig {
        EngineConfig::for_testing(
            dir.path().join("test.db"),
            ServerId::try_new("test-server".to_string()).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_should_open_pool_and_answer_queries_when_initializing() {
        let dir = tempdir().unwrap();
        let connection = DatabaseConnection::initialize(&test_config(&dir))
            .await
            .unwrap();

        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(connection.pool())
            .await
            .unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn test_should_return_value_without_retrying_when_operation_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, sqlx::Error>(42) }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_should_give_up_immediately_when_error_is_not_retryable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_should_retry_with_backoff_when_pool_times_out() {
        // PoolTimedOut counts as retryable pool saturation.
        let calls = AtomicU32::new(0);
        let result = with_retry(2, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
