//! The seam between the pool and whatever executes workers.

use std::collections::HashMap;

use changeflow_core::{PoolMessage, WorkerMessage};
use tokio::sync::mpsc;

use super::{TerminationReason, WorkerId};
use crate::error::PoolError;

/// Everything a worker reports back, tagged with its identity.
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker: WorkerId,
    pub kind: WorkerEventKind,
}

#[derive(Debug)]
pub enum WorkerEventKind {
    /// A well-formed protocol message.
    Message(WorkerMessage),
    /// A line that did not parse; carries the parse error.
    Malformed(String),
    /// The worker is gone. Always the last event for a worker.
    Exited(TerminationReason),
}

/// Channel on which a runtime delivers [`WorkerEvent`]s to the pool.
pub type WorkerEvents = mpsc::UnboundedSender<WorkerEvent>;

/// Per-worker spawn parameters, passed through verbatim.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    /// Added to the worker's inherited environment.
    pub env: HashMap<String, String>,
    /// Appended to the worker's command line.
    pub args: Vec<String>,
}

/// Control-side end of one worker's channel.
pub trait WorkerLink: Send {
    /// Queue one message for delivery. Never blocks.
    fn send(&mut self, message: &PoolMessage) -> Result<(), PoolError>;

    /// Force the worker down. An `Exited` event follows.
    fn kill(&mut self);
}

/// Something that can start workers.
pub trait WorkerRuntime: Send + Sync {
    /// Start a worker. Messages and the final exit are reported on `events`.
    fn spawn(
        &self,
        worker: WorkerId,
        spec: &SpawnSpec,
        events: WorkerEvents,
    ) -> Result<Box<dyn WorkerLink>, PoolError>;
}
