//! Aggregates runners into a single run/stop lifecycle
//!
//! A service typically hosts several runners (one per task family). The
//! server starts them in order, tears everything down if any of them fails
//! to start, and exposes one wait handle covering every child's drain.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::task::TaskTracker;
use tracing::warn;

use crate::db::Task;
use crate::runner::Runner;

/// A runner as seen by the [`RunnerServer`]: runners over different task
/// types compose behind this object-safe surface.
#[async_trait]
pub trait ManagedRunner: Send + Sync {
    async fn run(&self) -> Result<()>;
    fn stop(&self) -> TaskTracker;
}

#[async_trait]
impl<T: Task> ManagedRunner for Runner<T> {
    async fn run(&self) -> Result<()> {
        Runner::run(self).await
    }

    fn stop(&self) -> TaskTracker {
        Runner::stop(self)
    }
}

struct ServerEntry {
    runner: Box<dyn ManagedRunner>,
    running: AtomicBool,
}

/// Composes a list of runners into one lifecycle.
#[derive(Default)]
pub struct RunnerServer {
    runners: Vec<ServerEntry>,
}

impl RunnerServer {
    pub fn new(runners: Vec<Box<dyn ManagedRunner>>) -> Self {
        Self {
            runners: runners
                .into_iter()
                .map(|runner| ServerEntry {
                    runner,
                    running: AtomicBool::new(false),
                })
                .collect(),
        }
    }

    pub fn push(&mut self, runner: Box<dyn ManagedRunner>) {
        self.runners.push(ServerEntry {
            runner,
            running: AtomicBool::new(false),
        });
    }

    /// Start every runner in order. If one fails to start, stop the ones
    /// already running and propagate the error.
    pub async fn run(&self) -> Result<()> {
        for entry in &self.runners {
            if let Err(err) = entry.runner.run().await {
                warn!(error = %err, "runner failed to start, stopping server");
                self.stop();
                return Err(err);
            }
            entry.running.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Signal every running child to stop and return a handle that resolves
    /// once all of their drains are idle. No ordering between children.
    pub fn stop(&self) -> ServerShutdown {
        let trackers = self
            .runners
            .iter()
            .filter(|entry| entry.running.load(Ordering::SeqCst))
            .map(|entry| entry.runner.stop())
            .collect();
        ServerShutdown { trackers }
    }
}

/// Wait handle returned by [`RunnerServer::stop`].
pub struct ServerShutdown {
    trackers: Vec<TaskTracker>,
}

impl ServerShutdown {
    pub async fn wait(self) {
        join_all(self.trackers.iter().map(|tracker| tracker.wait())).await;
    }
}
