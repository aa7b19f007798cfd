//! Session-locked task runner
//!
//! A `Runner` owns exactly one database session and drives two loops: a work
//! loop that fetches and executes this session's share of tasks on a fixed
//! cadence, and a keep-alive loop that bumps the session's expiration so
//! long-running work does not lose its claim. When the session is lost the
//! work loop adopts a fresh one; nothing short of [`Runner::stop`] terminates
//! the loops.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{KEEP_ALIVE_INTERVAL, SESSION_TTL, STARTUP_JITTER_MAX};
use crate::db::{Database, DbError, DbFinder, Task};
use crate::telemetry::{Metrics, Tracer};

/// Executes a batch of tasks and reports which ones completed.
///
/// Only the returned tasks are marked finished; tasks a failed batch did not
/// report stay bound to the session and are re-dispatched on a later tick.
/// Whether a tasker that fails mid-batch reports the completed prefix or
/// nothing is its own choice.
#[async_trait]
pub trait Tasker<T: Task>: Send + Sync {
    async fn run_tasks(&self, tasks: Vec<T>) -> Result<Vec<T>>;
}

/// A [`Tasker`] built from a plain async function; see [`tasker_fn`].
#[derive(Clone)]
pub struct TaskerFn<F> {
    f: F,
}

/// Wrap a plain async function as a [`Tasker`].
pub fn tasker_fn<F>(f: F) -> TaskerFn<F> {
    TaskerFn { f }
}

#[async_trait]
impl<T, F, Fut> Tasker<T> for TaskerFn<F>
where
    T: Task,
    F: Fn(Vec<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<T>>> + Send,
{
    async fn run_tasks(&self, tasks: Vec<T>) -> Result<Vec<T>> {
        (self.f)(tasks).await
    }
}

/// Tuning knobs for a [`Runner`].
#[derive(Builder, Clone, Debug)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct RunnerConfig {
    /// Name reported in logs, metrics, and spans.
    #[builder(setter(into))]
    pub name: String,
    /// How often the work loop checks for tasks.
    pub loop_tick: Duration,
    /// Upper bound on how many additional tasks one fetch may bind to the
    /// session. The session can hold more than this if earlier pickups left
    /// it larger.
    pub tasks_per_session: i64,
    /// Upper bound on the random pre-loop sleep.
    #[builder(default = "STARTUP_JITTER_MAX")]
    pub startup_jitter: Duration,
    /// Cadence of the keep-alive bump.
    #[builder(default = "KEEP_ALIVE_INTERVAL")]
    pub keep_alive_interval: Duration,
}

impl RunnerConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(keep_alive) = self.keep_alive_interval {
            if keep_alive >= SESSION_TTL / 2 {
                return Err(format!(
                    "keep_alive_interval {:?} must be below half the session TTL {:?}",
                    keep_alive, SESSION_TTL
                ));
            }
        }
        Ok(())
    }
}

/// Supervises one session's worth of periodic work.
pub struct Runner<T: Task> {
    inner: Arc<RunnerInner<T>>,
}

struct RunnerInner<T: Task> {
    config: RunnerConfig,
    finder: Arc<dyn DbFinder<T>>,
    tasker: Arc<dyn Tasker<T>>,
    metrics: Arc<dyn Metrics>,
    tracer: Arc<dyn Tracer>,
    session_id: RwLock<i64>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl<T: Task> Runner<T> {
    pub fn new(
        config: RunnerConfig,
        finder: Arc<dyn DbFinder<T>>,
        tasker: Arc<dyn Tasker<T>>,
        metrics: Arc<dyn Metrics>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                config,
                finder,
                tasker,
                metrics,
                tracer,
                session_id: RwLock::new(0),
                stop: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Open a session and start the work and keep-alive loops.
    ///
    /// Returns an error only if the database cannot be resolved or the
    /// initial session cannot be opened; both loops run detached afterwards.
    /// Calling this more than once is not supported.
    pub async fn run(&self) -> Result<()> {
        let db = self
            .inner
            .finder
            .find()
            .await
            .context("Failed to find database")?;

        let session_id = self
            .inner
            .start_session(db.as_ref())
            .await
            .context("Failed to open initial session")?;
        *self.inner.session_id.write().await = session_id;
        info!(
            runner = %self.inner.config.name,
            session_id,
            "runner session opened"
        );

        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move { inner.work_loop().await });

        let inner = Arc::clone(&self.inner);
        self.inner
            .tracker
            .spawn(async move { inner.keep_alive_loop().await });

        Ok(())
    }

    /// Signal both loops to stop and return the drain handle.
    ///
    /// The handle's `wait()` resolves once the in-flight work call (if any)
    /// has completed and the session has been ended.
    pub fn stop(&self) -> TaskTracker {
        self.inner.stop.cancel();
        self.inner.tracker.close();
        self.inner.tracker.clone()
    }

    /// The session this runner currently represents. Changes only on
    /// session-lost recovery.
    pub async fn session_id(&self) -> i64 {
        *self.inner.session_id.read().await
    }
}

impl<T: Task> RunnerInner<T> {
    async fn start_session(&self, db: &dyn Database<T>) -> Result<i64, DbError> {
        let mut span = self.tracer.start_span("runner start session");
        let result = db.start_session().await;
        match &result {
            Ok(session_id) => span.set_tag("session_id", &session_id.to_string()),
            Err(err) => span.set_error(&err.to_string()),
        }
        span.finish();
        result
    }

    async fn end_session(&self) {
        let mut span = self.tracer.start_span("runner end session");
        let result = async {
            let db = self
                .finder
                .find()
                .await
                .map_err(|err| DbError::Message(err.to_string()))?;
            let session_id = self.session_id.read().await;
            db.end_session(*session_id).await
        }
        .await;
        if let Err(err) = &result {
            span.set_error(&err.to_string());
            warn!(
                runner = %self.config.name,
                error = %err,
                "failed to end session"
            );
        }
        span.finish();
    }

    async fn work_loop(&self) {
        // Spread out instances that boot together so they do not pile up on
        // the work lock on their first fetch.
        if !self.config.startup_jitter.is_zero() {
            let jitter_ms = self.config.startup_jitter.as_millis() as u64;
            let wait = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.end_session().await;
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let mut tick = tokio::time::interval(self.config.loop_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Discard the interval's immediate first fire; the first real tick
        // comes one period after startup.
        tick.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.end_session().await;
                    return;
                }
                _ = tick.tick() => {
                    // Keep fetching until the backlog is drained so bursts
                    // catch up faster than the tick period allows.
                    loop {
                        match self.do_work().await {
                            Ok(0) => break,
                            Ok(_) => continue,
                            Err(err) => {
                                warn!(
                                    runner = %self.config.name,
                                    error = %err,
                                    "work iteration failed"
                                );
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn keep_alive_loop(&self) {
        let mut tick = tokio::time::interval(self.config.keep_alive_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    // Stop bumping so the session expires promptly and other
                    // runners pick up anything left behind.
                    return;
                }
                _ = tick.tick() => {
                    let result = async {
                        let db = self
                            .finder
                            .find()
                            .await
                            .map_err(|err| DbError::Message(err.to_string()))?;
                        let session_id = self.session_id.read().await;
                        db.bump_session(*session_id).await
                    }
                    .await;
                    if let Err(err) = result {
                        // The work loop observes the same condition through
                        // get_work and recovers there.
                        warn!(
                            runner = %self.config.name,
                            error = %err,
                            "failed to bump session"
                        );
                    }
                }
            }
        }
    }

    /// One work iteration. Returns how many tasks the fetch produced so the
    /// caller can drain the backlog.
    async fn do_work(&self) -> Result<usize> {
        let start = Instant::now();
        let name = self.config.name.clone();
        let session_id = *self.session_id.read().await;

        let mut span = self.tracer.start_span("doing work");
        span.set_tag("session_id", &session_id.to_string());
        self.metrics.background_rate(session_id, &name, 1);

        let result = self.work_once(session_id, start, &name).await;
        if let Err(err) = &result {
            span.set_error(&err.to_string());
        }
        span.finish();
        result
    }

    async fn work_once(&self, session_id: i64, start: Instant, name: &str) -> Result<usize> {
        let db = match self.finder.find().await {
            Ok(db) => db,
            Err(err) => {
                self.handle_error(start, session_id, name, "Failed to find DB", &err.to_string());
                return Err(err).context("finding database");
            }
        };

        let guard = self.session_id.read().await;
        let fetched = match db.get_work(*guard, self.config.tasks_per_session).await {
            Ok(tasks) => {
                drop(guard);
                tasks
            }
            Err(DbError::SessionNotFound) => {
                drop(guard);
                info!(runner = %name, "session expired, starting a new one");
                let mut writer = self.session_id.write().await;
                match db.start_session().await {
                    Ok(new_id) => *writer = new_id,
                    Err(err) => {
                        self.handle_error(
                            start,
                            session_id,
                            name,
                            "Failed to start session",
                            &err.to_string(),
                        );
                        return Err(err).context("starting replacement session");
                    }
                }
                // The next tick fetches under the new session.
                self.metrics.background_duration(session_id, name, start.elapsed());
                return Ok(0);
            }
            Err(err) => {
                drop(guard);
                self.handle_error(
                    start,
                    session_id,
                    name,
                    "Failed getting work from db",
                    &err.to_string(),
                );
                return Err(err).context("getting work");
            }
        };

        if fetched.is_empty() {
            self.metrics.background_duration(session_id, name, start.elapsed());
            return Ok(0);
        }

        let fetched_count = fetched.len();
        debug!(runner = %name, count = fetched_count, "fetched tasks");
        let completed = match self.tasker.run_tasks(fetched).await {
            Ok(completed) => completed,
            Err(err) => {
                self.handle_error(start, session_id, name, "Error running tasks", &err.to_string());
                return Err(err).context("running tasks");
            }
        };

        let task_ids: Vec<i64> = completed.iter().map(|task| task.id()).collect();
        if let Err(err) = db.finish_tasks(&task_ids).await {
            self.handle_error(start, session_id, name, "Error finishing tasks", &err.to_string());
            return Err(err).context("finishing tasks");
        }

        self.metrics.background_duration(session_id, name, start.elapsed());
        Ok(fetched_count)
    }

    fn handle_error(&self, start: Instant, session_id: i64, name: &str, code: &str, message: &str) {
        self.metrics
            .background_duration(session_id, name, start.elapsed());
        self.metrics
            .background_error(session_id, name, code, message, 1);
    }
}
