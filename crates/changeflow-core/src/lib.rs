//! changeflow Core Library
//!
//! Shared functionality for changeflow components:
//! - Wire protocol between the pool and its workers (NDJSON)
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod ndjson;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use ndjson::{Job, PoolMessage, WorkerMessage};
