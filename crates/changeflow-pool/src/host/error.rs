//! Error types for the worker host.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Handler module not found: {module}")]
    ModuleNotFound { module: String },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] changeflow_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
