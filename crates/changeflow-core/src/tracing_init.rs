//! Logging setup for the pool process and its workers.
//!
//! Everything is written to stderr. A worker's stdout is the protocol pipe,
//! and any log line there reaches the pool as a malformed message.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CRATES: [&str; 3] = ["changeflow", "changeflow_pool", "changeflow_core"];

/// Filter directive enabling `level` for every changeflow crate.
pub fn level_directive(level: &str) -> String {
    CRATES
        .iter()
        .map(|krate| format!("{krate}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global subscriber at `level`. `RUST_LOG` wins when set.
pub fn init_tracing(level: &str, log_json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .init();
    }
}
