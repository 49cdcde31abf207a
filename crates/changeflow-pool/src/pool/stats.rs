//! Pool statistics snapshots.

use crate::worker::WorkerState;

/// Point-in-time view of a pool, published after every event it handles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers spawned and waiting for their handshake.
    pub starting: usize,
    /// Idle workers.
    pub ready: usize,
    /// Workers running a job.
    pub busy: usize,
    /// Workers asked or forced to stop that have not exited yet.
    pub stopping: usize,
    /// Jobs waiting for a worker.
    pub queued: usize,
    /// Change resources not yet released.
    pub tracked_changes: usize,
    /// `stop()` has been requested.
    pub draining: bool,
    pub spawned_total: u64,
    /// Jobs acknowledged with `done`, failed or not.
    pub completed_total: u64,
    /// Jobs whose handler reported an error.
    pub failed_jobs_total: u64,
    /// Workers sent `stop`.
    pub terminated_total: u64,
    /// Spawn failures, unexpected exits, malformed or out-of-order messages.
    pub faults_total: u64,
    /// Every worker has exited after `stop()`.
    pub shutdown_complete: bool,
}

impl PoolStats {
    /// Live workers in any state.
    pub const fn workers(&self) -> usize {
        self.starting + self.ready + self.busy + self.stopping
    }

    pub(crate) fn count(&mut self, state: WorkerState) {
        match state {
            WorkerState::Starting => self.starting += 1,
            WorkerState::Ready => self.ready += 1,
            WorkerState::Busy => self.busy += 1,
            WorkerState::Stopping => self.stopping += 1,
            WorkerState::Exited => {}
        }
    }
}
