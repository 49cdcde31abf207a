//! changeflow worker pool
//!
//! Dispatches database change notifications to a bounded set of isolated
//! workers:
//! - FIFO job queue with on-demand worker spawning up to a fixed limit
//! - Reference-counted change resources, released exactly once
//! - Worker lifecycle over an NDJSON protocol (child processes or tasks)
//! - Draining shutdown that completes only when every worker has exited

pub mod error;
pub mod feed;
pub mod host;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod worker;

pub use error::PoolError;
pub use pool::{PoolOptions, PoolStats, WorkerPool};
pub use registry::{Acknowledged, ChangeRegistry, ChangeResource};
