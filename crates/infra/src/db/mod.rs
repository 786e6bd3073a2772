//! SQLite persistence: connection pool, schema and sqlx error mapping.
//!
//! One database backs both the order aggregate tables and the `task_queue`
//! table, so a handler can commit domain writes and enqueue follow-up work in
//! the same transaction.
//!
//! ## Error Mapping
//!
//! | sqlx error | `DbError` |
//! |------------|-----------|
//! | Database (unique violation) | `Conflict` |
//! | Database (foreign key / check / not-null violation) | `Constraint` |
//! | Database (`SQLITE_BUSY` / `SQLITE_LOCKED`) | `Unavailable` |
//! | PoolTimedOut / PoolClosed / Io | `Unavailable` |
//! | anything else | `Storage` |

pub mod orders;
mod schema;

use std::str::FromStr;
use std::time::Duration;

use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

pub use orders::{
    ChargeOutcome, DEFAULT_PAGE_LIMIT, LoadStrategy, MAX_PAGE_LIMIT, OrderRepository, Pagination,
    RepositoryError,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Storage-level failure, classified so callers can decide whether to retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("database unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl DbError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Unavailable(_))
    }
}

/// Shared handle to the SQLite pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to a SQLite database URL (e.g. `sqlite://orderflow.db?mode=rwc`).
    ///
    /// Foreign keys are always enforced. File databases run in WAL mode with a
    /// busy timeout so concurrent workers wait for the write lock instead of
    /// failing immediately.
    #[instrument(skip(url), err)]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("parse_database_url", e))?
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        debug!(max_connections, "database pool ready");
        Ok(Self { pool })
    }

    /// Private in-memory database with the schema applied.
    ///
    /// The pool holds exactly one connection that never expires, since every
    /// SQLite `:memory:` connection is a separate database.
    pub async fn connect_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("parse_database_url", e))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Create all tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), DbError> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Map sqlx errors to `DbError`, tagging the message with the failed operation.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DbError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("{operation}: {}", db_err.message());

            if is_busy_code(db_err.code().as_deref()) {
                return DbError::Unavailable(msg);
            }

            match db_err.kind() {
                ErrorKind::UniqueViolation => DbError::Conflict(msg),
                ErrorKind::ForeignKeyViolation
                | ErrorKind::CheckViolation
                | ErrorKind::NotNullViolation => DbError::Constraint(msg),
                _ => DbError::Storage(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            DbError::Unavailable(format!("{operation}: timed out waiting for a connection"))
        }
        sqlx::Error::PoolClosed => {
            DbError::Unavailable(format!("{operation}: connection pool closed"))
        }
        sqlx::Error::Io(io) => DbError::Unavailable(format!("{operation}: {io}")),
        other => DbError::Storage(format!("{operation}: {other}")),
    }
}

// SQLite reports extended result codes; the low byte is the primary code.
fn is_busy_code(code: Option<&str>) -> bool {
    const SQLITE_BUSY: i64 = 5;
    const SQLITE_LOCKED: i64 = 6;

    code.and_then(|c| c.parse::<i64>().ok())
        .map(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}
