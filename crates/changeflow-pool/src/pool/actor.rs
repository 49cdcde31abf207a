//! The task that owns all pool state.
//!
//! Commands from [`WorkerPool`](super::WorkerPool) handles, worker events and
//! kill deadlines are handled one at a time from a single `select!` loop, so
//! roster, queue and registry need no locking.

use std::sync::Arc;

use changeflow_core::{Job, WorkerMessage};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::options::PoolOptions;
use super::stats::PoolStats;
use super::{Command, Notification};
use crate::error::PoolError;
use crate::queue::JobQueue;
use crate::registry::{Acknowledged, ChangeRegistry};
use crate::worker::{
    SpawnSpec, TerminationReason, WorkerEvent, WorkerEventKind, WorkerHandle, WorkerId,
    WorkerRuntime, WorkerState,
};

/// Whether another worker may be started.
///
/// A worker is added only while the roster is under the limit and smaller
/// than the number of jobs waiting for one.
pub(super) const fn should_spawn(roster_len: usize, max_workers: usize, pending: usize) -> bool {
    roster_len < max_workers && roster_len < pending
}

pub(super) struct PoolActor {
    module: String,
    options: PoolOptions,
    spawn_spec: SpawnSpec,
    runtime: Arc<dyn WorkerRuntime>,
    roster: Vec<WorkerHandle>,
    queue: JobQueue,
    registry: ChangeRegistry,
    stopping: bool,
    next_worker_id: u64,
    totals: PoolStats,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    done_tx: watch::Sender<bool>,
    stats_tx: watch::Sender<PoolStats>,
}

impl PoolActor {
    pub(super) fn new(
        module: String,
        mut options: PoolOptions,
        runtime: Arc<dyn WorkerRuntime>,
        commands: mpsc::UnboundedReceiver<Command>,
        done_tx: watch::Sender<bool>,
        stats_tx: watch::Sender<PoolStats>,
    ) -> Self {
        if options.max_workers == 0 {
            warn!("max_workers of 0 raised to 1");
            options.max_workers = 1;
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            module,
            spawn_spec: options.spawn_spec(),
            options,
            runtime,
            roster: Vec::new(),
            queue: JobQueue::new(),
            registry: ChangeRegistry::new(),
            stopping: false,
            next_worker_id: 1,
            totals: PoolStats::default(),
            commands,
            events_tx,
            events_rx,
            done_tx,
            stats_tx,
        }
    }

    pub(super) async fn run(mut self) {
        info!(
            module = %self.module,
            max_workers = self.options.max_workers,
            "Worker pool started"
        );

        let mut commands_open = true;
        loop {
            if !commands_open && self.shutdown_complete() {
                break;
            }
            let deadline = self.next_kill_deadline();

            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(Command::Notify(notification)) => self.notify(notification),
                    Some(Command::Stop) => self.begin_stop(),
                    None => {
                        debug!("All pool handles dropped");
                        commands_open = false;
                        self.begin_stop();
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                () = sleep_until(deadline) => self.kill_overdue(),
            }

            self.publish_stats();
        }

        debug!("Worker pool actor exiting");
    }

    // ========================================================================
    // Producer side
    // ========================================================================

    fn notify(&mut self, notification: Notification) {
        if self.stopping {
            notification.discard();
            return;
        }
        let job = match notification {
            Notification::Available { path } => Job::Available { path },
            Notification::Change(resource) => Job::Change {
                change_id: self.registry.track(resource),
            },
            Notification::Delete(resource) => Job::Delete {
                change_id: self.registry.track(resource),
            },
        };
        self.dispatch(job);
    }

    /// Hand `job` to a ready worker, or queue it (starting a worker if allowed).
    fn dispatch(&mut self, mut job: Job) {
        while let Some(index) = self.first_ready() {
            match self.roster[index].send(job) {
                Ok(()) => return,
                Err((e, returned)) => {
                    self.link_broken(index, &e);
                    job = returned;
                }
            }
        }

        if should_spawn(self.roster.len(), self.options.max_workers, self.queue.len() + 1) {
            self.spawn_worker();
        }
        debug!(kind = job.kind(), queued = self.queue.len() + 1, "Job queued");
        self.queue.push(job);
    }

    // ========================================================================
    // Worker side
    // ========================================================================

    fn handle_event(&mut self, event: WorkerEvent) {
        let worker = event.worker;
        let Some(index) = self.position(worker) else {
            debug!(worker_id = %worker, "Event from retired worker ignored");
            return;
        };

        match event.kind {
            WorkerEventKind::Message(WorkerMessage::Ready) => {
                if let Err(e) = self.roster[index].mark_ready() {
                    warn!(error = %e, "Ignoring unexpected ready");
                    self.totals.faults_total += 1;
                }
            }
            WorkerEventKind::Message(WorkerMessage::Done { change_id, error }) => {
                self.job_done(index, change_id, error);
            }
            WorkerEventKind::Malformed(reason) => {
                let err = PoolError::MalformedMessage { worker, reason };
                warn!(error = %err, "Ignoring worker message");
                self.totals.faults_total += 1;
            }
            WorkerEventKind::Exited(reason) => self.worker_exited(index, reason),
        }

        self.pump();
    }

    fn job_done(&mut self, index: usize, change_id: Option<String>, error: Option<String>) {
        let worker = self.roster[index].id();
        let job = match self.roster[index].complete() {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Ignoring done from idle worker");
                self.totals.faults_total += 1;
                return;
            }
        };

        self.totals.completed_total += 1;
        if let Some(error) = error {
            self.totals.failed_jobs_total += 1;
            warn!(
                worker_id = %worker,
                kind = job.kind(),
                change_id = ?job.change_id(),
                error = %error,
                "Job failed"
            );
        } else {
            debug!(worker_id = %worker, kind = job.kind(), "Job done");
        }

        if let Some(change_id) = change_id {
            match self.registry.acknowledge(&change_id) {
                Ok(Acknowledged::Released) => {}
                Ok(Acknowledged::Retained { remaining }) => {
                    debug!(change_id = %change_id, remaining, "Change still referenced");
                }
                Err(e) => warn!(worker_id = %worker, error = %e, "Ignoring acknowledgment"),
            }
        }
    }

    fn worker_exited(&mut self, index: usize, reason: TerminationReason) {
        let mut handle = self.roster.remove(index);
        let worker = handle.id();
        let report = handle.exited();

        if report.solicited {
            if reason.is_success() {
                info!(worker_id = %worker, jobs = handle.jobs_completed(), "Worker exited");
            } else {
                warn!(worker_id = %worker, reason = %reason, "Worker exited uncleanly after stop");
            }
            return;
        }

        if reason.is_success() {
            warn!(worker_id = %worker, state = %report.previous, "Worker exited without being asked");
        } else {
            self.totals.faults_total += 1;
            let err = PoolError::UnexpectedExit { worker, reason };
            error!(error = %err, state = %report.previous, "Worker lost");
        }
        if let Some(job) = report.in_flight {
            // Neither retried nor released.
            warn!(
                worker_id = %worker,
                kind = job.kind(),
                change_id = ?job.change_id(),
                "In-flight job abandoned"
            );
        }
    }

    fn link_broken(&mut self, index: usize, err: &PoolError) {
        warn!(error = %err, "Worker link broken");
        self.totals.faults_total += 1;
        self.roster[index].kill();
    }

    // ========================================================================
    // Re-dispatch and shutdown
    // ========================================================================

    /// Move the pool forward after any state change.
    fn pump(&mut self) {
        while !self.queue.is_empty() {
            let Some(index) = self.first_ready() else {
                break;
            };
            let Some(job) = self.queue.pop() else {
                break;
            };
            if let Err((e, job)) = self.roster[index].send(job) {
                self.link_broken(index, &e);
                self.queue.requeue_front(job);
            }
        }

        // Replace capacity lost to exits.
        if !self.queue.is_empty()
            && self.first_ready().is_none()
            && should_spawn(self.roster.len(), self.options.max_workers, self.queue.len())
        {
            self.spawn_worker();
        }

        if !self.stopping {
            return;
        }

        if !self.queue.is_empty() && self.roster.is_empty() {
            self.abandon_backlog();
        }

        if self.queue.is_empty() {
            let grace = self.options.terminate_timeout;
            for handle in &mut self.roster {
                if handle.state() != WorkerState::Ready {
                    continue;
                }
                match handle.terminate(grace) {
                    Ok(()) => self.totals.terminated_total += 1,
                    Err(e) => warn!(error = %e, "Failed to terminate worker"),
                }
            }
            if self.roster.is_empty() {
                self.complete_shutdown();
            }
        }
    }

    fn begin_stop(&mut self) {
        if self.stopping {
            debug!("Stop already in progress");
            return;
        }
        self.stopping = true;
        info!(
            queued = self.queue.len(),
            workers = self.roster.len(),
            "Stopping worker pool"
        );
        self.pump();
    }

    /// Drop queued jobs no worker can ever take, acknowledging their changes.
    fn abandon_backlog(&mut self) {
        let jobs: Vec<Job> = self.queue.drain().collect();
        error!(jobs = jobs.len(), "No worker available during shutdown, abandoning queued jobs");
        for job in jobs {
            self.totals.faults_total += 1;
            if let Some(change_id) = job.change_id()
                && let Err(e) = self.registry.acknowledge(change_id)
            {
                warn!(error = %e, "Abandoned job had no tracked change");
            }
        }
    }

    fn complete_shutdown(&mut self) {
        if self.shutdown_complete() {
            return;
        }
        info!(
            spawned = self.totals.spawned_total,
            completed = self.totals.completed_total,
            faults = self.totals.faults_total,
            "Worker pool stopped"
        );
        self.done_tx.send_replace(true);
    }

    fn kill_overdue(&mut self) {
        let now = Instant::now();
        for handle in &mut self.roster {
            if handle.kill_deadline().is_some_and(|deadline| deadline <= now) {
                warn!(worker_id = %handle.id(), "Worker did not stop in time");
                handle.kill();
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn spawn_worker(&mut self) {
        let id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;

        match WorkerHandle::spawn(
            self.runtime.as_ref(),
            id,
            &self.module,
            &self.spawn_spec,
            self.events_tx.clone(),
        ) {
            Ok(handle) => {
                self.roster.push(handle);
                self.totals.spawned_total += 1;
            }
            Err(e) => {
                error!(worker_id = %id, error = %e, "Failed to spawn worker");
                self.totals.faults_total += 1;
            }
        }
    }

    fn first_ready(&self) -> Option<usize> {
        self.roster
            .iter()
            .position(|h| h.state() == WorkerState::Ready)
    }

    fn position(&self, worker: WorkerId) -> Option<usize> {
        self.roster.iter().position(|h| h.id() == worker)
    }

    fn next_kill_deadline(&self) -> Option<Instant> {
        self.roster.iter().filter_map(WorkerHandle::kill_deadline).min()
    }

    fn shutdown_complete(&self) -> bool {
        *self.done_tx.borrow()
    }

    fn publish_stats(&self) {
        let mut stats = PoolStats {
            queued: self.queue.len(),
            tracked_changes: self.registry.len(),
            draining: self.stopping,
            shutdown_complete: self.shutdown_complete(),
            ..self.totals.clone()
        };
        for handle in &self.roster {
            stats.count(handle.state());
        }
        self.stats_tx.send_if_modified(|current| {
            if *current == stats {
                false
            } else {
                *current = stats;
                true
            }
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
