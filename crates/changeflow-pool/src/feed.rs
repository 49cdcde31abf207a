//! Line-oriented event feed for the `changeflow run` command.
//!
//! One event per line:
//!
//! ```text
//! available /var/db/main.db
//! change 7f3a
//! delete 7f3b
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use tracing::info;

use crate::pool::WorkerPool;
use crate::registry::ChangeResource;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("Unknown event '{0}'")]
    UnknownEvent(String),

    #[error("Event '{0}' needs an argument")]
    MissingArgument(&'static str),
}

/// One parsed feed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    Available(String),
    Change(String),
    Delete(String),
}

impl FeedEvent {
    /// Submit the event to `pool`.
    pub fn submit(self, pool: &WorkerPool) {
        match self {
            Self::Available(path) => pool.notify_available(path),
            Self::Change(id) => pool.notify_change(TokenResource::new(id)),
            Self::Delete(id) => pool.notify_delete(TokenResource::new(id)),
        }
    }
}

/// Parse one feed line. `Ok(None)` for blank lines and comments.
pub fn parse_feed_line(line: &str) -> Result<Option<FeedEvent>, FeedError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (event, arg) = match line.split_once(char::is_whitespace) {
        Some((event, arg)) => (event, arg.trim()),
        None => (line, ""),
    };
    let event = match event {
        "available" => FeedEvent::Available(require(arg, "available")?),
        "change" => FeedEvent::Change(require(arg, "change")?),
        "delete" => FeedEvent::Delete(require(arg, "delete")?),
        other => return Err(FeedError::UnknownEvent(other.to_string())),
    };
    Ok(Some(event))
}

fn require(arg: &str, event: &'static str) -> Result<String, FeedError> {
    if arg.is_empty() {
        Err(FeedError::MissingArgument(event))
    } else {
        Ok(arg.to_string())
    }
}

/// Change resource that is nothing but its identifier. Release is logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenResource {
    id: String,
}

impl TokenResource {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl ChangeResource for TokenResource {
    fn serialize(&self) -> String {
        self.id.clone()
    }

    fn release(self: Box<Self>) {
        info!(change_id = %self.id, "Change released");
    }
}
