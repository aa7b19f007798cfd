//! Database contract for session-locked work distribution
//!
//! The runner treats the database as an opaque collaborator exposing five
//! operations: open, bump, and end a session, fetch the session's share of
//! work, and mark finished tasks. [`postgres::PgDatabase`] implements the
//! contract against the installed server-side procedures;
//! [`memory::MemoryDatabase`] implements the same semantics in process for
//! tests and local runs.

pub mod memory;
pub mod postgres;
pub mod schema;

use std::sync::Arc;

use async_trait::async_trait;

pub use postgres::{PgDatabase, ScanTask};

/// SQLSTATE raised by `bump_session` (and surfaced through `get_work`) when
/// the target session is no longer live. Stable wire contract between the
/// database and the runner.
pub const SQL_ERROR_SESSION_NOT_FOUND: &str = "SL001";

/// Error returned by [`Database`] operations.
///
/// The runner dispatches on the `SessionNotFound` variant to recover from an
/// expired session; everything else is treated as a transient infrastructure
/// failure and retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("session not found")]
    SessionNotFound,
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(sqlx::Error),
}

impl DbError {
    /// Stable error code for this failure, suitable for metric tags.
    pub fn code(&self) -> &'static str {
        match self {
            DbError::SessionNotFound => SQL_ERROR_SESSION_NOT_FOUND,
            DbError::Message(_) => "DB000",
            DbError::Sqlx(_) => "DB001",
        }
    }

    pub fn is_session_not_found(&self) -> bool {
        matches!(self, DbError::SessionNotFound)
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        // Fold the SL001 SQLSTATE into the distinguished variant so callers
        // never match on strings.
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some(SQL_ERROR_SESSION_NOT_FOUND) {
                return DbError::SessionNotFound;
            }
        }
        DbError::Sqlx(err)
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// A unit of embedder-defined work with a stable 64-bit identity.
///
/// The runner never looks inside a task; it only carries batches from
/// `get_work` to the tasker and reports the completed IDs back through
/// `finish_tasks`.
pub trait Task: Send + Sync + 'static {
    fn id(&self) -> i64;
}

/// The five operations a session-locked runner needs from its database.
#[async_trait]
pub trait Database<T: Task>: Send + Sync {
    /// Insert a new session row and return its ID.
    async fn start_session(&self) -> DbResult<i64>;

    /// Extend the session's expiration, only if it is still live. Fails with
    /// [`DbError::SessionNotFound`] otherwise; an expired session cannot be
    /// resurrected.
    async fn bump_session(&self, session_id: i64) -> DbResult<()>;

    /// Force the session's expiration into the past. Idempotent: ending an
    /// already-expired session succeeds silently.
    async fn end_session(&self, session_id: i64) -> DbResult<()>;

    /// Rebalance open tasks across live sessions and return the tasks bound
    /// to this session. `batch_size` caps how many additional tasks this
    /// call may bind; the session can already hold more than that.
    async fn get_work(&self, session_id: i64, batch_size: i64) -> DbResult<Vec<T>>;

    /// Mark the listed task IDs complete. Idempotent with respect to
    /// already-finished IDs.
    async fn finish_tasks(&self, task_ids: &[i64]) -> DbResult<()>;
}

/// Resolves a database handle for the runner.
///
/// Called on every loop iteration so the underlying connection target can
/// move between ticks without restarting the runner.
#[async_trait]
pub trait DbFinder<T: Task>: Send + Sync {
    async fn find(&self) -> anyhow::Result<Arc<dyn Database<T>>>;
}

/// A shared database handle is its own finder for the common fixed-target
/// case.
#[async_trait]
impl<T: Task, D: Database<T> + 'static> DbFinder<T> for Arc<D> {
    async fn find(&self) -> anyhow::Result<Arc<dyn Database<T>>> {
        Ok(Arc::clone(self) as Arc<dyn Database<T>>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_not_found_code() {
        let err = DbError::SessionNotFound;
        assert_eq!(err.code(), "SL001");
        assert!(err.is_session_not_found());
    }

    #[test]
    fn test_generic_errors_keep_their_own_codes() {
        let err = DbError::Message("connection refused".to_string());
        assert_ne!(err.code(), SQL_ERROR_SESSION_NOT_FOUND);
        assert!(!err.is_session_not_found());
    }
}
