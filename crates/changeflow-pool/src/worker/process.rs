//! Workers as OS child processes.
//!
//! The worker speaks NDJSON on stdin/stdout; stderr is inherited so worker
//! logs land next to the pool's own.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::runtime::{SpawnSpec, WorkerEvents, WorkerLink, WorkerRuntime};
use super::{TerminationReason, WorkerId, conduit};
use crate::error::PoolError;

/// Hidden subcommand the `changeflow` binary runs as a worker.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Spawns each worker as `<program> <base_args..> <spawn_args..>`.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    program: PathBuf,
    base_args: Vec<String>,
}

impl ProcessRuntime {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
        }
    }

    /// Arguments placed before the per-pool spawn arguments.
    #[must_use]
    pub fn with_base_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.base_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Re-execute the running binary in worker mode.
    pub fn current_exe() -> Result<Self, PoolError> {
        let exe = std::env::current_exe().map_err(|e| PoolError::SpawnFailure {
            reason: format!("cannot locate current executable: {e}"),
        })?;
        Ok(Self::new(exe).with_base_args([WORKER_SUBCOMMAND]))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerRuntime for ProcessRuntime {
    fn spawn(
        &self,
        worker: WorkerId,
        spec: &SpawnSpec,
        events: WorkerEvents,
    ) -> Result<Box<dyn WorkerLink>, PoolError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PoolError::SpawnFailure {
            reason: format!("{}: {e}", self.program.display()),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| PoolError::SpawnFailure {
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PoolError::SpawnFailure {
            reason: "failed to capture stdout".into(),
        })?;

        info!(
            worker_id = %worker,
            pid = child.id(),
            program = %self.program.display(),
            "Worker process started"
        );

        let link = conduit::open(worker, stdout, stdin, events, move |kill| {
            supervise(worker, child, kill)
        });
        Ok(Box::new(link))
    }
}

async fn supervise(
    worker: WorkerId,
    mut child: Child,
    kill: oneshot::Receiver<()>,
) -> TerminationReason {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => TerminationReason::from(status),
            Err(e) => {
                warn!(worker_id = %worker, error = %e, "Failed to wait for worker process");
                TerminationReason::Unknown
            }
        },
        Ok(()) = kill => {
            if let Err(e) = child.kill().await {
                warn!(worker_id = %worker, error = %e, "Failed to kill worker process");
            }
            TerminationReason::Killed
        }
    }
}
