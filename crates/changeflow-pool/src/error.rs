//! Pool-level fault types.
//!
//! None of these cross the `notify_*` boundary: the pool logs them and keeps
//! running with whatever workers it still has.

use crate::worker::{TerminationReason, WorkerId, WorkerState};

/// Faults observed by the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailure { reason: String },

    #[error("Worker {worker} exited unexpectedly: {reason}")]
    UnexpectedExit {
        worker: WorkerId,
        reason: TerminationReason,
    },

    #[error("Acknowledgment for unknown change id: {change_id}")]
    UnknownChangeId { change_id: String },

    #[error("Malformed message from worker {worker}: {reason}")]
    MalformedMessage { worker: WorkerId, reason: String },

    #[error("Worker {worker} cannot {operation} while {state}")]
    InvalidState {
        worker: WorkerId,
        state: WorkerState,
        operation: &'static str,
    },

    #[error("Channel to worker {worker} is closed")]
    ChannelClosed { worker: WorkerId },
}
