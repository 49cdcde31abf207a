//! FIFO queue of jobs waiting for a worker.

use std::collections::VecDeque;

use changeflow_core::Job;

/// Pending jobs in arrival order.
///
/// Plain data: the pool actor is its only owner, so there is no locking here.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job at the tail.
    pub fn push(&mut self, job: Job) {
        debug_assert!(!job.is_terminate(), "Terminate is never queued");
        self.jobs.push_back(job);
    }

    /// Remove and return the head.
    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    /// Put back a job that was popped but could not be delivered.
    ///
    /// The job returns to the head, so the relative order of everything
    /// queued is unchanged.
    pub fn requeue_front(&mut self, job: Job) {
        debug_assert!(!job.is_terminate(), "Terminate is never queued");
        self.jobs.push_front(job);
    }

    /// Remove every job, head first.
    pub fn drain(&mut self) -> impl Iterator<Item = Job> + '_ {
        self.jobs.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}
