//! In-memory implementation of the database contract
//!
//! Runs the same balancing algorithm as the server-side `get_work` procedure
//! under a single mutex, which plays the `work_lock` row's serializing role.
//! Used by this crate's tests; exported so embedders can test their taskers
//! without a database.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::{Database, DbError, DbResult, Task};
use crate::config::SESSION_TTL;

struct SessionRow {
    expires: DateTime<Utc>,
}

struct TaskRow<T> {
    task: T,
    session_id: Option<i64>,
    finished: bool,
}

struct State<T> {
    next_session_id: i64,
    sessions: BTreeMap<i64, SessionRow>,
    tasks: BTreeMap<i64, TaskRow<T>>,
}

impl<T: Task + Clone> State<T> {
    fn bump_session(
        &mut self,
        session_id: i64,
        now: DateTime<Utc>,
        ttl: ChronoDuration,
    ) -> DbResult<()> {
        match self.sessions.get_mut(&session_id) {
            Some(row) if row.expires > now => {
                row.expires = now + ttl;
                Ok(())
            }
            _ => Err(DbError::SessionNotFound),
        }
    }

    fn live_session_count(&self, now: DateTime<Utc>) -> i64 {
        self.sessions.values().filter(|s| s.expires > now).count() as i64
    }

    fn open_task_count(&self) -> i64 {
        self.tasks.values().filter(|t| !t.finished).count() as i64
    }

    fn task_count_for_session(&self, session_id: i64) -> i64 {
        self.tasks
            .values()
            .filter(|t| !t.finished && t.session_id == Some(session_id))
            .count() as i64
    }

    fn pickup_tasks_for_session(&mut self, session_id: i64, limit: i64, now: DateTime<Utc>) {
        if limit <= 0 {
            return;
        }
        let eligible: Vec<i64> = {
            let sessions = &self.sessions;
            self.tasks
                .iter()
                .filter(|(_, row)| {
                    !row.finished
                        && row.session_id.is_none_or(|bound| {
                            sessions
                                .get(&bound)
                                .is_none_or(|session| session.expires <= now)
                        })
                })
                .map(|(id, _)| *id)
                .take(limit as usize)
                .collect()
        };
        for id in eligible {
            if let Some(row) = self.tasks.get_mut(&id) {
                row.session_id = Some(session_id);
            }
        }
    }

    fn tasks_for_session(&self, session_id: i64) -> Vec<T> {
        self.tasks
            .values()
            .filter(|row| !row.finished && row.session_id == Some(session_id))
            .map(|row| row.task.clone())
            .collect()
    }
}

/// In-memory [`Database`] with the same session and balancing semantics as
/// the Postgres procedures.
pub struct MemoryDatabase<T> {
    session_ttl: ChronoDuration,
    state: Mutex<State<T>>,
}

impl<T: Task + Clone> Default for MemoryDatabase<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Task + Clone> MemoryDatabase<T> {
    pub fn new() -> Self {
        Self::with_session_ttl(SESSION_TTL)
    }

    /// Use a custom session TTL. Tests shrink this to exercise expiry
    /// hand-off without waiting out the production TTL.
    pub fn with_session_ttl(ttl: Duration) -> Self {
        Self {
            session_ttl: ChronoDuration::from_std(ttl).expect("session ttl out of range"),
            state: Mutex::new(State {
                next_session_id: 1,
                sessions: BTreeMap::new(),
                tasks: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().expect("memory database poisoned")
    }

    /// Add an open, unassigned task to the pool.
    pub fn insert_task(&self, task: T) {
        let mut state = self.lock();
        state.tasks.insert(
            task.id(),
            TaskRow {
                task,
                session_id: None,
                finished: false,
            },
        );
    }

    pub fn insert_tasks(&self, tasks: impl IntoIterator<Item = T>) {
        for task in tasks {
            self.insert_task(task);
        }
    }

    /// Force a session's expiration into the past, as if its TTL elapsed
    /// without a bump.
    pub fn expire_session(&self, session_id: i64) {
        let mut state = self.lock();
        if let Some(row) = state.sessions.get_mut(&session_id) {
            row.expires = Utc::now() - ChronoDuration::seconds(1);
        }
    }

    pub fn live_session_count(&self) -> i64 {
        self.lock().live_session_count(Utc::now())
    }

    pub fn open_task_count(&self) -> i64 {
        self.lock().open_task_count()
    }

    /// The session a task is currently bound to, if any.
    pub fn session_for_task(&self, task_id: i64) -> Option<i64> {
        self.lock().tasks.get(&task_id).and_then(|row| row.session_id)
    }

    /// IDs of open tasks bound to `session_id`, in task-ID order.
    pub fn task_ids_for_session(&self, session_id: i64) -> Vec<i64> {
        self.lock()
            .tasks
            .iter()
            .filter(|(_, row)| !row.finished && row.session_id == Some(session_id))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn finished_task_ids(&self) -> Vec<i64> {
        self.lock()
            .tasks
            .iter()
            .filter(|(_, row)| row.finished)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[async_trait]
impl<T: Task + Clone> Database<T> for MemoryDatabase<T> {
    async fn start_session(&self) -> DbResult<i64> {
        let now = Utc::now();
        let mut state = self.lock();
        let session_id = state.next_session_id;
        state.next_session_id += 1;
        state.sessions.insert(
            session_id,
            SessionRow {
                expires: now + self.session_ttl,
            },
        );
        Ok(session_id)
    }

    async fn bump_session(&self, session_id: i64) -> DbResult<()> {
        let now = Utc::now();
        self.lock().bump_session(session_id, now, self.session_ttl)
    }

    async fn end_session(&self, session_id: i64) -> DbResult<()> {
        let mut state = self.lock();
        if let Some(row) = state.sessions.get_mut(&session_id) {
            row.expires = DateTime::<Utc>::MIN_UTC;
        }
        Ok(())
    }

    async fn get_work(&self, session_id: i64, batch_size: i64) -> DbResult<Vec<T>> {
        let now = Utc::now();
        // Holding the state mutex across the whole rebalance is the
        // in-process equivalent of the work_lock row lock.
        let mut state = self.lock();

        state.bump_session(session_id, now, self.session_ttl)?;

        let live_sessions = state.live_session_count(now);
        let open_tasks = state.open_task_count();
        // The bump above guarantees at least one live session.
        let ideal = (open_tasks + live_sessions - 1) / live_sessions;
        let current_load = state.task_count_for_session(session_id);

        if current_load < ideal {
            let deficit = (ideal - current_load).min(batch_size);
            state.pickup_tasks_for_session(session_id, deficit, now);
        }

        Ok(state.tasks_for_session(session_id))
    }

    async fn finish_tasks(&self, task_ids: &[i64]) -> DbResult<()> {
        let mut state = self.lock();
        for id in task_ids {
            if let Some(row) = state.tasks.get_mut(id) {
                row.finished = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestTask {
        id: i64,
    }

    impl Task for TestTask {
        fn id(&self) -> i64 {
            self.id
        }
    }

    fn db_with_tasks(count: i64) -> MemoryDatabase<TestTask> {
        let db = MemoryDatabase::new();
        db.insert_tasks((1..=count).map(|id| TestTask { id }));
        db
    }

    fn ids(tasks: &[TestTask]) -> Vec<i64> {
        tasks.iter().map(|t| t.id).collect()
    }

    #[tokio::test]
    async fn test_get_work_returns_only_own_tasks() {
        let db = db_with_tasks(4);
        let session = db.start_session().await.unwrap();

        let tasks = db.get_work(session, 100).await.unwrap();

        for task in &tasks {
            assert_eq!(db.session_for_task(task.id), Some(session));
        }
    }

    #[tokio::test]
    async fn test_single_session_claims_everything() {
        let db = db_with_tasks(7);
        let session = db.start_session().await.unwrap();

        let tasks = db.get_work(session, 100).await.unwrap();

        assert_eq!(ids(&tasks), vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_two_sessions_split_the_pool_disjointly() {
        let db = db_with_tasks(10);
        let a = db.start_session().await.unwrap();
        let b = db.start_session().await.unwrap();

        let a_tasks = db.get_work(a, 100).await.unwrap();
        let b_tasks = db.get_work(b, 100).await.unwrap();

        assert_eq!(a_tasks.len(), 5);
        assert_eq!(b_tasks.len(), 5);
        let overlap: Vec<i64> = ids(&a_tasks)
            .into_iter()
            .filter(|id| ids(&b_tasks).contains(id))
            .collect();
        assert!(overlap.is_empty(), "sessions share tasks: {:?}", overlap);
    }

    #[tokio::test]
    async fn test_ceiling_share_leaves_no_task_stranded() {
        // T=5, S=2: ideal is 3, so the two sessions cover all 5 between them.
        let db = db_with_tasks(5);
        let a = db.start_session().await.unwrap();
        let b = db.start_session().await.unwrap();

        let a_tasks = db.get_work(a, 100).await.unwrap();
        let b_tasks = db.get_work(b, 100).await.unwrap();

        assert!(a_tasks.len() <= 3);
        assert!(b_tasks.len() <= 3);
        assert_eq!(a_tasks.len() + b_tasks.len(), 5);
    }

    #[tokio::test]
    async fn test_get_work_with_no_tasks_is_empty_not_an_error() {
        let db: MemoryDatabase<TestTask> = MemoryDatabase::new();
        let session = db.start_session().await.unwrap();

        let tasks = db.get_work(session, 100).await.unwrap();

        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_zero_batch_size_returns_bound_tasks_without_pickup() {
        let db = db_with_tasks(4);
        let session = db.start_session().await.unwrap();

        // Bind two, then fetch with a zero cap: the bound two come back and
        // nothing new is claimed.
        let first = db.get_work(session, 2).await.unwrap();
        assert_eq!(first.len(), 2);

        let second = db.get_work(session, 0).await.unwrap();
        assert_eq!(ids(&second), ids(&first));
        assert_eq!(db.session_for_task(3), None);
        assert_eq!(db.session_for_task(4), None);
    }

    #[tokio::test]
    async fn test_batch_size_caps_pickup_not_fetch() {
        let db = db_with_tasks(6);
        let session = db.start_session().await.unwrap();

        // Two picks of 2 leave the session holding 4; a further capped fetch
        // still returns all 4 plus the new pickup.
        db.get_work(session, 2).await.unwrap();
        db.get_work(session, 2).await.unwrap();
        let tasks = db.get_work(session, 2).await.unwrap();

        assert_eq!(tasks.len(), 6);
    }

    #[tokio::test]
    async fn test_expired_session_tasks_are_eligible_again() {
        let db = db_with_tasks(5);
        let a = db.start_session().await.unwrap();
        db.get_work(a, 100).await.unwrap();
        assert_eq!(db.task_ids_for_session(a).len(), 5);

        db.expire_session(a);
        let b = db.start_session().await.unwrap();
        let b_tasks = db.get_work(b, 100).await.unwrap();

        assert_eq!(ids(&b_tasks), vec![1, 2, 3, 4, 5]);
        assert!(db.task_ids_for_session(a).is_empty());
    }

    #[tokio::test]
    async fn test_bump_extends_a_live_session() {
        let db: MemoryDatabase<TestTask> = MemoryDatabase::new();
        let session = db.start_session().await.unwrap();

        assert!(db.bump_session(session).await.is_ok());
        assert_eq!(db.live_session_count(), 1);
    }

    #[tokio::test]
    async fn test_bump_on_expired_session_fails_with_sl001() {
        let db: MemoryDatabase<TestTask> = MemoryDatabase::new();
        let session = db.start_session().await.unwrap();
        db.expire_session(session);

        let err = db.bump_session(session).await.unwrap_err();

        assert!(err.is_session_not_found());
        assert_eq!(err.code(), "SL001");
    }

    #[tokio::test]
    async fn test_end_then_bump_fails_with_sl001() {
        let db: MemoryDatabase<TestTask> = MemoryDatabase::new();
        let session = db.start_session().await.unwrap();

        db.end_session(session).await.unwrap();
        let err = db.bump_session(session).await.unwrap_err();

        assert!(err.is_session_not_found());
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        let db: MemoryDatabase<TestTask> = MemoryDatabase::new();
        let session = db.start_session().await.unwrap();

        db.end_session(session).await.unwrap();
        db.end_session(session).await.unwrap();
        // Ending a session that never existed also succeeds silently.
        db.end_session(9999).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_work_on_expired_session_fails_with_sl001() {
        let db = db_with_tasks(3);
        let session = db.start_session().await.unwrap();
        db.expire_session(session);

        let err = db.get_work(session, 100).await.unwrap_err();

        assert!(err.is_session_not_found());
    }

    #[tokio::test]
    async fn test_finish_tasks_is_idempotent() {
        let db = db_with_tasks(3);
        let session = db.start_session().await.unwrap();
        db.get_work(session, 100).await.unwrap();

        db.finish_tasks(&[1, 2]).await.unwrap();
        db.finish_tasks(&[1, 2]).await.unwrap();

        assert_eq!(db.finished_task_ids(), vec![1, 2]);
        assert_eq!(db.open_task_count(), 1);
    }

    #[tokio::test]
    async fn test_finished_tasks_never_come_back() {
        let db = db_with_tasks(3);
        let session = db.start_session().await.unwrap();
        db.get_work(session, 100).await.unwrap();
        db.finish_tasks(&[1, 2, 3]).await.unwrap();

        let tasks = db.get_work(session, 100).await.unwrap();

        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_equilibrium_covers_the_whole_pool() {
        let db = db_with_tasks(10);
        let mut sessions = Vec::new();
        for _ in 0..3 {
            sessions.push(db.start_session().await.unwrap());
        }

        for &session in &sessions {
            db.get_work(session, 100).await.unwrap();
        }

        let ideal = 4; // ceil(10 / 3)
        let mut covered = Vec::new();
        for &session in &sessions {
            let bound = db.task_ids_for_session(session);
            assert!(bound.len() <= ideal, "session {session} over ideal share");
            covered.extend(bound);
        }
        covered.sort_unstable();
        assert_eq!(covered, (1..=10).collect::<Vec<i64>>());
    }
}
