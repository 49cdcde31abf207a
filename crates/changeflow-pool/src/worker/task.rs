//! Workers as supervised tokio tasks.
//!
//! Each worker runs [`host::serve`] on its own task, connected to the pool by
//! an in-memory duplex pipe. A panic inside a handler ends only that worker.

use std::sync::Arc;

use tokio::io::BufReader;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::runtime::{SpawnSpec, WorkerEvents, WorkerLink, WorkerRuntime};
use super::{TerminationReason, WorkerId, conduit};
use crate::error::PoolError;
use crate::host::{self, HandlerLoader, HostError};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Runs workers inside the current tokio runtime.
#[derive(Clone)]
pub struct TaskRuntime {
    loader: Arc<dyn HandlerLoader>,
}

impl TaskRuntime {
    pub fn new(loader: Arc<dyn HandlerLoader>) -> Self {
        Self { loader }
    }
}

impl std::fmt::Debug for TaskRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRuntime").finish_non_exhaustive()
    }
}

impl WorkerRuntime for TaskRuntime {
    fn spawn(
        &self,
        worker: WorkerId,
        spec: &SpawnSpec,
        events: WorkerEvents,
    ) -> Result<Box<dyn WorkerLink>, PoolError> {
        if !spec.env.is_empty() || !spec.args.is_empty() {
            debug!(worker_id = %worker, "Spawn env and args do not apply to task workers");
        }

        let (pool_side, worker_side) = tokio::io::duplex(PIPE_CAPACITY);
        let (pool_read, pool_write) = tokio::io::split(pool_side);
        let (worker_read, worker_write) = tokio::io::split(worker_side);

        let loader = Arc::clone(&self.loader);
        let task = tokio::spawn(async move {
            host::serve(BufReader::new(worker_read), worker_write, &*loader).await
        });

        let link = conduit::open(worker, pool_read, pool_write, events, move |kill| {
            supervise(worker, task, kill)
        });
        Ok(Box::new(link))
    }
}

async fn supervise(
    worker: WorkerId,
    mut task: JoinHandle<Result<(), HostError>>,
    kill: oneshot::Receiver<()>,
) -> TerminationReason {
    tokio::select! {
        joined = &mut task => match joined {
            Ok(Ok(())) => TerminationReason::Exited(0),
            Ok(Err(e)) => {
                warn!(worker_id = %worker, error = %e, "Worker host failed");
                TerminationReason::Exited(1)
            }
            Err(e) if e.is_panic() => TerminationReason::Panicked(panic_message(e.into_panic())),
            Err(_) => TerminationReason::Killed,
        },
        Ok(()) = kill => {
            task.abort();
            let _ = task.await;
            TerminationReason::Killed
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use changeflow_core::{Job, PoolMessage, WorkerMessage};
    use tokio::sync::mpsc;

    use super::*;
    use crate::host::HandlerRegistry;
    use crate::worker::{WorkerEvent, WorkerEventKind};

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEventKind {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for worker event")
            .expect("event channel closed")
            .kind
    }

    fn runtime() -> TaskRuntime {
        let registry = HandlerRegistry::new()
            .with_handler("ok", |_job| async { Ok(()) })
            .with_handler("boom", |_job| async { panic!("handler exploded") })
            .with_handler("hang", |_job| async {
                std::future::pending::<()>().await;
                Ok(())
            });
        TaskRuntime::new(Arc::new(registry))
    }

    fn load(module: &str) -> PoolMessage {
        PoolMessage::Load {
            module: module.to_string(),
        }
    }

    fn change(id: &str) -> PoolMessage {
        PoolMessage::Job(Job::Change {
            change_id: id.to_string(),
        })
    }

    #[tokio::test]
    async fn full_session_exits_cleanly() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = runtime().spawn(WorkerId(1), &SpawnSpec::default(), tx).unwrap();

        link.send(&load("ok")).unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            WorkerEventKind::Message(WorkerMessage::Ready)
        ));

        link.send(&change("c1")).unwrap();
        match next_event(&mut rx).await {
            WorkerEventKind::Message(WorkerMessage::Done { change_id, error }) => {
                assert_eq!(change_id.as_deref(), Some("c1"));
                assert!(error.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }

        link.send(&PoolMessage::Stop).unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            WorkerEventKind::Exited(TerminationReason::Exited(0))
        ));
    }

    #[tokio::test]
    async fn unknown_module_exits_with_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = runtime().spawn(WorkerId(2), &SpawnSpec::default(), tx).unwrap();
        link.send(&load("missing")).unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            WorkerEventKind::Exited(TerminationReason::Exited(1))
        ));
    }

    #[tokio::test]
    async fn handler_panic_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = runtime().spawn(WorkerId(3), &SpawnSpec::default(), tx).unwrap();
        link.send(&load("boom")).unwrap();
        next_event(&mut rx).await;
        link.send(&change("c1")).unwrap();

        match next_event(&mut rx).await {
            WorkerEventKind::Exited(TerminationReason::Panicked(message)) => {
                assert!(message.contains("handler exploded"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn kill_aborts_a_hung_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = runtime().spawn(WorkerId(4), &SpawnSpec::default(), tx).unwrap();
        link.send(&load("hang")).unwrap();
        next_event(&mut rx).await;
        link.send(&change("c1")).unwrap();
        link.kill();

        assert!(matches!(
            next_event(&mut rx).await,
            WorkerEventKind::Exited(TerminationReason::Killed)
        ));
    }

    #[tokio::test]
    async fn dropping_the_link_ends_the_worker() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut link = runtime().spawn(WorkerId(5), &SpawnSpec::default(), tx).unwrap();
        link.send(&load("ok")).unwrap();
        next_event(&mut rx).await;
        drop(link);

        assert!(matches!(
            next_event(&mut rx).await,
            WorkerEventKind::Exited(TerminationReason::Exited(0))
        ));
    }
}
