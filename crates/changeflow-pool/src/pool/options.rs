//! Pool construction options.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use changeflow_core::config::PoolConfig;

use crate::worker::SpawnSpec;

/// Default grace period between `stop` and a forced kill.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for a [`WorkerPool`](super::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Upper bound on concurrently running workers. Never below 1.
    pub max_workers: usize,
    /// Added to every worker's inherited environment.
    pub env: HashMap<String, String>,
    /// Appended verbatim to every worker's command line.
    pub spawn_args: Vec<String>,
    /// How long a stopping worker may take before it is killed.
    pub terminate_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            env: HashMap::new(),
            spawn_args: Vec::new(),
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }
}

impl PoolOptions {
    /// Set the worker limit. Zero is treated as one.
    #[must_use]
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_spawn_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.spawn_args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    pub(crate) fn spawn_spec(&self) -> SpawnSpec {
        SpawnSpec {
            env: self.env.clone(),
            args: self.spawn_args.clone(),
        }
    }
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        let options = Self {
            env: config.env.clone(),
            spawn_args: config.spawn_args.clone(),
            terminate_timeout: Duration::from_secs(config.terminate_timeout_secs),
            ..Self::default()
        };
        match config.max_workers {
            Some(n) => options.with_max_workers(n),
            None => options,
        }
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
