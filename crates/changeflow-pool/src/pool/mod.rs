//! Bounded worker pool.
//!
//! [`WorkerPool`] is a cheap, cloneable handle. All state lives in a single
//! actor task (see `actor.rs`); handles talk to it over an unbounded channel,
//! so `notify_*` never blocks and never fails. Shutdown completion is a
//! `watch<bool>` every `stop()` caller waits on.

mod actor;
mod options;
mod stats;


pub use options::{DEFAULT_TERMINATE_TIMEOUT, PoolOptions};
pub use stats::PoolStats;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use self::actor::PoolActor;
use crate::error::PoolError;
use crate::registry::ChangeResource;
use crate::worker::{ProcessRuntime, WorkerRuntime};

/// An external event, before it becomes a job.
pub(crate) enum Notification {
    Available { path: String },
    Change(Box<dyn ChangeResource>),
    Delete(Box<dyn ChangeResource>),
}

impl Notification {
    /// Drop an event the pool will not run, releasing its resource.
    fn discard(self) {
        match self {
            Self::Available { path } => {
                debug!(path = %path, "Pool stopping, available event dropped");
            }
            Self::Change(resource) | Self::Delete(resource) => {
                debug!(change_id = %resource.serialize(), "Pool stopping, change released");
                resource.release();
            }
        }
    }
}

pub(crate) enum Command {
    Notify(Notification),
    Stop,
}

/// Handle to a running worker pool.
///
/// Dropping every handle without calling [`stop`](Self::stop) begins the
/// same shutdown in the background.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    done: watch::Receiver<bool>,
    stats: watch::Receiver<PoolStats>,
}

impl WorkerPool {
    /// Start a pool whose workers are child processes running this binary's
    /// `worker` subcommand with `module` as the handler.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(module: impl Into<String>, options: PoolOptions) -> Result<Self, PoolError> {
        let runtime = ProcessRuntime::current_exe()?;
        Ok(Self::with_runtime(module, options, Arc::new(runtime)))
    }

    /// Start a pool on a custom runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_runtime(
        module: impl Into<String>,
        options: PoolOptions,
        runtime: Arc<dyn WorkerRuntime>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        let (stats_tx, stats_rx) = watch::channel(PoolStats::default());

        let actor = PoolActor::new(module.into(), options, runtime, command_rx, done_tx, stats_tx);
        tokio::spawn(actor.run());

        Self {
            commands: command_tx,
            done: done_rx,
            stats: stats_rx,
        }
    }

    /// A database path became available.
    pub fn notify_available(&self, path: impl Into<String>) {
        self.submit(Notification::Available { path: path.into() });
    }

    /// A change resource is ready to be processed.
    pub fn notify_change(&self, resource: impl ChangeResource) {
        self.submit(Notification::Change(Box::new(resource)));
    }

    /// A change resource describes a deletion.
    pub fn notify_delete(&self, resource: impl ChangeResource) {
        self.submit(Notification::Delete(Box::new(resource)));
    }

    /// Stop admitting work, drain the queue, stop every worker.
    ///
    /// Resolves once every worker has exited. Safe to call any number of
    /// times from any number of handles.
    pub async fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        let mut done = self.done.clone();
        // An error means the actor is gone, which only happens after shutdown.
        let _ = done.wait_for(|complete| *complete).await;
    }

    /// Latest statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        self.stats.borrow().clone()
    }

    /// Subscribe to statistics updates.
    pub fn watch_stats(&self) -> watch::Receiver<PoolStats> {
        self.stats.clone()
    }

    fn submit(&self, notification: Notification) {
        if let Err(mpsc::error::SendError(command)) = self.commands.send(Command::Notify(notification))
            && let Command::Notify(notification) = command
        {
            notification.discard();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &*self.stats.borrow())
            .finish_non_exhaustive()
    }
}
