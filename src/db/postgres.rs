//! Postgres-backed implementation of the database contract
//!
//! Thin wrappers over the server-side procedures installed by
//! [`crate::db::schema`]. All balancing logic lives in SQL behind the
//! `work_lock` row; this side only binds parameters, maps SQLSTATE `SL001`
//! onto [`DbError::SessionNotFound`], and converts rows into tasks.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgRow;

use super::{Database, DbError, DbResult, Task};

/// Converts a row returned by `get_work` into an embedder task value.
pub type ScanTask<T> = Arc<dyn Fn(&PgRow) -> DbResult<T> + Send + Sync>;

/// [`Database`] implementation over a shared [`PgPool`].
pub struct PgDatabase<T> {
    pool: PgPool,
    scan: ScanTask<T>,
}

impl<T> Clone for PgDatabase<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            scan: Arc::clone(&self.scan),
        }
    }
}

impl<T: Task> PgDatabase<T> {
    /// Create a store that converts work rows through `scan`.
    pub fn new(pool: PgPool, scan: ScanTask<T>) -> Self {
        Self { pool, scan }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Total open tasks, as counted by the installed `get_task_count`
    /// procedure. Useful for operational checks; the rebalance itself runs
    /// server-side.
    pub async fn task_count(&self) -> DbResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT get_task_count()")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Open tasks currently bound to `session_id`.
    pub async fn task_count_for_session(&self, session_id: i64) -> DbResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT get_task_count_for_session($1)")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

impl<T> PgDatabase<T>
where
    T: Task + for<'r> sqlx::FromRow<'r, PgRow> + Unpin,
{
    /// Create a store for task types that derive [`sqlx::FromRow`].
    pub fn from_row(pool: PgPool) -> Self {
        Self::new(
            pool,
            Arc::new(|row| T::from_row(row).map_err(DbError::from)),
        )
    }
}

#[async_trait]
impl<T: Task> Database<T> for PgDatabase<T> {
    async fn start_session(&self) -> DbResult<i64> {
        let session_id = sqlx::query_scalar::<_, i64>("SELECT start_session()")
            .fetch_one(&self.pool)
            .await?;
        Ok(session_id)
    }

    async fn bump_session(&self, session_id: i64) -> DbResult<()> {
        sqlx::query("SELECT bump_session($1)")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn end_session(&self, session_id: i64) -> DbResult<()> {
        sqlx::query("SELECT end_session($1)")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_work(&self, session_id: i64, batch_size: i64) -> DbResult<Vec<T>> {
        let rows = sqlx::query("SELECT * FROM get_work($1, $2)")
            .bind(session_id)
            .bind(batch_size)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| (self.scan)(row)).collect()
    }

    async fn finish_tasks(&self, task_ids: &[i64]) -> DbResult<()> {
        sqlx::query("SELECT finish_tasks($1)")
            .bind(task_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
