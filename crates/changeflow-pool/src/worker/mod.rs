//! Worker lifecycle and transport.
//!
//! A worker is an isolated unit of execution that loads one handler module
//! and runs jobs one at a time. The pool talks to it only through messages:
//!
//! ```text
//!   pool ──load──▶ worker ──ready──▶ pool
//!   pool ──job───▶ worker ──done───▶ pool      (repeated)
//!   pool ──stop──▶ worker ──exit
//! ```
//!
//! Two runtimes provide workers: [`ProcessRuntime`] (OS child processes) and
//! [`TaskRuntime`] (supervised tokio tasks). Both speak the same NDJSON
//! protocol through [`conduit`].

pub(crate) mod conduit;
mod exit;
mod handle;
mod process;
mod runtime;
mod task;

pub use exit::TerminationReason;
pub use handle::{ExitReport, WorkerHandle, WorkerState};
pub use process::{ProcessRuntime, WORKER_SUBCOMMAND};
pub use runtime::{SpawnSpec, WorkerEvent, WorkerEventKind, WorkerEvents, WorkerLink, WorkerRuntime};
pub use task::TaskRuntime;

/// Pool-assigned worker identity. Never reused within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}
