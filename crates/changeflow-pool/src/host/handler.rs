//! Job handlers and the loaders that resolve them from a module name.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use changeflow_core::Job;
use changeflow_core::ndjson::encode_line;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::HostError;
use crate::worker::TerminationReason;

/// Handler execution result. The error text is reported back to the pool.
pub type JobResult = Result<(), String>;

/// Handler function type.
pub type JobHandler =
    Arc<dyn Fn(Job) -> Pin<Box<dyn Future<Output = JobResult> + Send>> + Send + Sync>;

/// Resolves the module named in a `load` message to a handler.
pub trait HandlerLoader: Send + Sync {
    fn load(&self, module: &str) -> Result<JobHandler, HostError>;
}

/// In-process handlers keyed by module name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `module`, replacing any previous one.
    pub fn register_handler<F, Fut>(&mut self, module: &str, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |job| Box::pin(handler(job)));
        self.handlers.insert(module.to_string(), handler);
    }

    /// Builder form of [`register_handler`](Self::register_handler).
    #[must_use]
    pub fn with_handler<F, Fut>(mut self, module: &str, handler: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult> + Send + 'static,
    {
        self.register_handler(module, handler);
        self
    }
}

impl HandlerLoader for HandlerRegistry {
    fn load(&self, module: &str) -> Result<JobHandler, HostError> {
        self.handlers
            .get(module)
            .cloned()
            .ok_or_else(|| HostError::ModuleNotFound {
                module: module.to_string(),
            })
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Treats the module name as the path of an executable.
///
/// Each job runs the executable once with the job's JSON object on stdin.
/// Exit status 0 means success. The executable's stdout goes to the worker's
/// stderr so it cannot corrupt the protocol stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecLoader;

impl HandlerLoader for ExecLoader {
    fn load(&self, module: &str) -> Result<JobHandler, HostError> {
        let program = PathBuf::from(module);
        if !program.is_file() {
            return Err(HostError::ModuleNotFound {
                module: module.to_string(),
            });
        }
        let handler: JobHandler = Arc::new(move |job| Box::pin(run_exec(program.clone(), job)));
        Ok(handler)
    }
}

async fn run_exec(program: PathBuf, job: Job) -> JobResult {
    let mut child = Command::new(&program)
        .env("CHANGEFLOW_JOB_TYPE", job.kind())
        .stdin(Stdio::piped())
        .stdout(Stdio::from(std::io::stderr()))
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("Failed to run {}: {e}", program.display()))?;

    if let Some(mut stdin) = child.stdin.take() {
        let mut payload = encode_line(&job);
        payload.push('\n');
        if let Err(e) = stdin.write_all(payload.as_bytes()).await {
            // Handlers are free to ignore their input.
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(format!("Failed to write job to {}: {e}", program.display()));
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| format!("Failed to wait for {}: {e}", program.display()))?;
    debug!(program = %program.display(), ?status, "Handler finished");

    if status.success() {
        Ok(())
    } else {
        Err(format!(
            "{} {}",
            program.display(),
            TerminationReason::from(status)
        ))
    }
}
