//! Pool-side view of one worker.

use std::time::Duration;

use changeflow_core::{Job, PoolMessage};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::runtime::{SpawnSpec, WorkerEvents, WorkerLink, WorkerRuntime};
use super::WorkerId;
use crate::error::PoolError;

/// Lifecycle state of a worker as seen by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Spawned, module load sent, waiting for `ready`.
    Starting,
    /// Idle; may receive one job.
    Ready,
    /// Running one job.
    Busy,
    /// Asked (or forced) to stop; receives nothing further.
    Stopping,
    /// Gone.
    Exited,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
            Self::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// What the pool needs to know once a worker has exited.
#[derive(Debug)]
pub struct ExitReport {
    /// The pool asked this worker to stop.
    pub solicited: bool,
    /// State the worker was in when it went away.
    pub previous: WorkerState,
    /// Job the worker was running, if any. Its change is never acknowledged.
    pub in_flight: Option<Job>,
}

/// One worker: its identity, state, channel and in-flight job.
pub struct WorkerHandle {
    id: WorkerId,
    state: WorkerState,
    pending: Option<Job>,
    link: Box<dyn WorkerLink>,
    terminate_sent: bool,
    kill_deadline: Option<Instant>,
    jobs_completed: u64,
}

impl WorkerHandle {
    /// Start a worker through `runtime` and instruct it to load `module`.
    pub fn spawn(
        runtime: &dyn WorkerRuntime,
        id: WorkerId,
        module: &str,
        spec: &SpawnSpec,
        events: WorkerEvents,
    ) -> Result<Self, PoolError> {
        let mut link = runtime.spawn(id, spec, events)?;
        if let Err(e) = link.send(&PoolMessage::Load {
            module: module.to_string(),
        }) {
            link.kill();
            return Err(PoolError::SpawnFailure {
                reason: format!("worker {id} rejected module load: {e}"),
            });
        }
        info!(worker_id = %id, module, "Worker spawned");

        Ok(Self {
            id,
            state: WorkerState::Starting,
            pending: None,
            link,
            terminate_sent: false,
            kill_deadline: None,
            jobs_completed: 0,
        })
    }

    pub const fn id(&self) -> WorkerId {
        self.id
    }

    pub const fn state(&self) -> WorkerState {
        self.state
    }

    pub const fn pending(&self) -> Option<&Job> {
        self.pending.as_ref()
    }

    pub const fn kill_deadline(&self) -> Option<Instant> {
        self.kill_deadline
    }

    pub const fn jobs_completed(&self) -> u64 {
        self.jobs_completed
    }

    /// Record the worker's `ready` after startup.
    pub fn mark_ready(&mut self) -> Result<(), PoolError> {
        self.expect_state(WorkerState::Starting, "mark ready")?;
        self.state = WorkerState::Ready;
        debug!(worker_id = %self.id, "Worker ready");
        Ok(())
    }

    /// Hand one job to a ready worker.
    ///
    /// On failure the job comes back with the error so the caller can
    /// requeue it.
    pub fn send(&mut self, job: Job) -> Result<(), (PoolError, Job)> {
        if self.state != WorkerState::Ready || job.is_terminate() {
            let err = PoolError::InvalidState {
                worker: self.id,
                state: self.state,
                operation: "send job",
            };
            return Err((err, job));
        }
        if let Err(e) = self.link.send(&PoolMessage::Job(job.clone())) {
            return Err((e, job));
        }
        debug!(worker_id = %self.id, kind = job.kind(), "Job dispatched");
        self.pending = Some(job);
        self.state = WorkerState::Busy;
        Ok(())
    }

    /// Record the worker's `done`. Returns the finished job.
    pub fn complete(&mut self) -> Result<Job, PoolError> {
        self.expect_state(WorkerState::Busy, "complete job")?;
        self.state = WorkerState::Ready;
        self.jobs_completed += 1;
        self.pending.take().ok_or(PoolError::InvalidState {
            worker: self.id,
            state: self.state,
            operation: "complete job",
        })
    }

    /// Ask an idle worker to stop. After `grace` it is eligible for [`kill`].
    ///
    /// [`kill`]: Self::kill
    pub fn terminate(&mut self, grace: Duration) -> Result<(), PoolError> {
        self.expect_state(WorkerState::Ready, "terminate")?;
        self.state = WorkerState::Stopping;
        self.terminate_sent = true;
        if let Err(e) = self.link.send(&PoolMessage::Stop) {
            warn!(worker_id = %self.id, error = %e, "Stop not delivered, killing worker");
            self.link.kill();
            return Ok(());
        }
        self.kill_deadline = Instant::now().checked_add(grace);
        if self.kill_deadline.is_none() {
            debug!(worker_id = %self.id, "Stop grace out of range, worker will not be killed");
        }
        debug!(worker_id = %self.id, "Worker asked to stop");
        Ok(())
    }

    /// Force the worker down. An `Exited` event follows.
    pub fn kill(&mut self) {
        if self.state == WorkerState::Exited {
            return;
        }
        warn!(worker_id = %self.id, state = %self.state, "Killing worker");
        self.link.kill();
        self.state = WorkerState::Stopping;
        self.kill_deadline = None;
    }

    /// Record that the worker has gone away.
    pub fn exited(&mut self) -> ExitReport {
        let previous = self.state;
        self.state = WorkerState::Exited;
        self.kill_deadline = None;
        ExitReport {
            solicited: self.terminate_sent,
            previous,
            in_flight: self.pending.take(),
        }
    }

    fn expect_state(&self, expected: WorkerState, operation: &'static str) -> Result<(), PoolError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(PoolError::InvalidState {
                worker: self.id,
                state: self.state,
                operation,
            })
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("jobs_completed", &self.jobs_completed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use changeflow_core::ndjson::encode_line;
    use tokio::sync::mpsc;

    use super::*;

    /// Link that records every line and can be made to fail.
    #[derive(Clone, Default)]
    struct Recorder {
        lines: Arc<Mutex<Vec<String>>>,
        killed: Arc<Mutex<bool>>,
        broken: Arc<Mutex<bool>>,
    }

    struct RecordingLink(Recorder, WorkerId);

    impl WorkerLink for RecordingLink {
        fn send(&mut self, message: &PoolMessage) -> Result<(), PoolError> {
            if *self.0.broken.lock().unwrap() {
                return Err(PoolError::ChannelClosed { worker: self.1 });
            }
            self.0.lines.lock().unwrap().push(encode_line(message));
            Ok(())
        }

        fn kill(&mut self) {
            *self.0.killed.lock().unwrap() = true;
        }
    }

    impl WorkerRuntime for Recorder {
        fn spawn(
            &self,
            worker: WorkerId,
            _spec: &SpawnSpec,
            _events: WorkerEvents,
        ) -> Result<Box<dyn WorkerLink>, PoolError> {
            Ok(Box::new(RecordingLink(self.clone(), worker)))
        }
    }

    fn spawn_handle(recorder: &Recorder) -> WorkerHandle {
        let (events, _rx) = mpsc::unbounded_channel();
        WorkerHandle::spawn(recorder, WorkerId(1), "handler.js", &SpawnSpec::default(), events)
            .unwrap()
    }

    fn change(id: &str) -> Job {
        Job::Change {
            change_id: id.to_string(),
        }
    }

    #[test]
    fn spawn_sends_load_first() {
        let recorder = Recorder::default();
        let handle = spawn_handle(&recorder);
        assert_eq!(handle.state(), WorkerState::Starting);
        assert_eq!(
            recorder.lines.lock().unwrap().as_slice(),
            [r#"{"kind":"load","module":"handler.js"}"#]
        );
    }

    #[test]
    fn spawn_fails_when_load_cannot_be_sent() {
        let recorder = Recorder::default();
        *recorder.broken.lock().unwrap() = true;
        let (events, _rx) = mpsc::unbounded_channel();
        let err = WorkerHandle::spawn(&recorder, WorkerId(3), "m", &SpawnSpec::default(), events)
            .unwrap_err();
        assert!(matches!(err, PoolError::SpawnFailure { .. }));
        assert!(*recorder.killed.lock().unwrap());
    }

    #[test]
    fn job_lifecycle() {
        let recorder = Recorder::default();
        let mut handle = spawn_handle(&recorder);

        // Not ready yet
        let (err, job) = handle.send(change("c1")).unwrap_err();
        assert!(matches!(err, PoolError::InvalidState { state: WorkerState::Starting, .. }));

        handle.mark_ready().unwrap();
        handle.send(job).unwrap();
        assert_eq!(handle.state(), WorkerState::Busy);
        assert_eq!(handle.pending(), Some(&change("c1")));

        // One job at a time
        assert!(handle.send(change("c2")).is_err());

        assert_eq!(handle.complete().unwrap(), change("c1"));
        assert_eq!(handle.state(), WorkerState::Ready);
        assert_eq!(handle.jobs_completed(), 1);
        assert!(handle.complete().is_err());
    }

    #[test]
    fn failed_send_returns_job_and_keeps_state() {
        let recorder = Recorder::default();
        let mut handle = spawn_handle(&recorder);
        handle.mark_ready().unwrap();
        *recorder.broken.lock().unwrap() = true;

        let (err, job) = handle.send(change("c1")).unwrap_err();
        assert!(matches!(err, PoolError::ChannelClosed { .. }));
        assert_eq!(job, change("c1"));
        assert_eq!(handle.state(), WorkerState::Ready);
        assert!(handle.pending().is_none());
    }

    #[tokio::test]
    async fn terminate_only_from_ready() {
        let recorder = Recorder::default();
        let mut handle = spawn_handle(&recorder);
        assert!(handle.terminate(Duration::from_secs(1)).is_err());

        handle.mark_ready().unwrap();
        handle.terminate(Duration::from_secs(1)).unwrap();
        assert_eq!(handle.state(), WorkerState::Stopping);
        assert!(handle.kill_deadline().is_some());
        assert_eq!(
            recorder.lines.lock().unwrap().last().map(String::as_str),
            Some(r#"{"kind":"stop"}"#)
        );

        let report = handle.exited();
        assert!(report.solicited);
        assert_eq!(report.previous, WorkerState::Stopping);
        assert_eq!(handle.state(), WorkerState::Exited);
    }

    #[tokio::test]
    async fn terminate_with_unbounded_grace_sets_no_deadline() {
        let recorder = Recorder::default();
        let mut handle = spawn_handle(&recorder);
        handle.mark_ready().unwrap();

        handle.terminate(Duration::from_secs(u64::MAX)).unwrap();
        assert_eq!(handle.state(), WorkerState::Stopping);
        assert!(handle.kill_deadline().is_none());
        assert!(!*recorder.killed.lock().unwrap());
        assert!(handle.exited().solicited);
    }

    #[test]
    fn crash_while_busy_reports_in_flight_job() {
        let recorder = Recorder::default();
        let mut handle = spawn_handle(&recorder);
        handle.mark_ready().unwrap();
        handle.send(change("c9")).unwrap();

        let report = handle.exited();
        assert!(!report.solicited);
        assert_eq!(report.previous, WorkerState::Busy);
        assert_eq!(report.in_flight, Some(change("c9")));
    }

    #[test]
    fn kill_is_not_a_solicited_stop() {
        let recorder = Recorder::default();
        let mut handle = spawn_handle(&recorder);
        handle.kill();
        assert!(*recorder.killed.lock().unwrap());
        assert_eq!(handle.state(), WorkerState::Stopping);
        assert!(!handle.exited().solicited);
    }
}
