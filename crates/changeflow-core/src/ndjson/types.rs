//! Message types for the changeflow worker protocol.

use serde::Deserialize;

/// One unit of dispatchable work.
///
/// `Terminate` is internal: it is never queued and never serialized as a job.
/// It travels on the wire as [`PoolMessage::Stop`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    /// A new database path became available.
    Available { path: String },
    /// A change resource is ready to be processed.
    Change {
        #[serde(rename = "changeId")]
        change_id: String,
    },
    /// A change resource describes a deletion.
    Delete {
        #[serde(rename = "changeId")]
        change_id: String,
    },
    /// Ask the worker to exit once idle.
    #[serde(skip)]
    Terminate,
}

impl Job {
    /// Identifier of the change resource this job references, if any.
    pub fn change_id(&self) -> Option<&str> {
        match self {
            Self::Change { change_id } | Self::Delete { change_id } => Some(change_id),
            Self::Available { .. } | Self::Terminate => None,
        }
    }

    /// Short, stable label for logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Available { .. } => "available",
            Self::Change { .. } => "change",
            Self::Delete { .. } => "delete",
            Self::Terminate => "terminate",
        }
    }

    pub const fn is_terminate(&self) -> bool {
        matches!(self, Self::Terminate)
    }
}

/// Message from the pool to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolMessage {
    /// Sent once right after spawn: load the handler module.
    Load { module: String },
    /// Run exactly one job.
    Job(Job),
    /// Exit once the current job (if any) is done.
    Stop,
}

impl From<Job> for PoolMessage {
    fn from(job: Job) -> Self {
        match job {
            Job::Terminate => Self::Stop,
            other => Self::Job(other),
        }
    }
}

/// Message from a worker to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Handshake after the module loaded.
    Ready,
    /// The job finished. `change_id` acknowledges a change resource; `error`
    /// carries the handler's failure message when the run failed.
    Done {
        change_id: Option<String>,
        error: Option<String>,
    },
}

impl WorkerMessage {
    /// Successful completion of `job`.
    pub fn done(job: &Job) -> Self {
        Self::Done {
            change_id: job.change_id().map(String::from),
            error: None,
        }
    }

    /// Failed completion of `job`; the change reference is still acknowledged.
    pub fn failed(job: &Job, error: impl Into<String>) -> Self {
        Self::Done {
            change_id: job.change_id().map(String::from),
            error: Some(error.into()),
        }
    }
}
