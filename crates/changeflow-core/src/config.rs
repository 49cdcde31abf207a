//! Configuration resolution for changeflow.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/changeflow/settings.json)
//! 3. Project config (.changeflow/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete changeflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on concurrently running workers. `None` means one per
    /// available CPU.
    pub max_workers: Option<usize>,
    /// Extra environment variables for every spawned worker.
    pub env: HashMap<String, String>,
    /// Extra arguments appended to every worker command line.
    pub spawn_args: Vec<String>,
    /// Seconds a stopping worker gets before it is killed.
    pub terminate_timeout_secs: u64,
    pub log_level: String,
    /// Worker executable. Defaults to the running binary.
    pub worker_program: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            env: HashMap::new(),
            spawn_args: Vec::new(),
            terminate_timeout_secs: 5,
            log_level: "info".to_string(),
            worker_program: None,
        }
    }
}

/// On-disk layer. Absent fields leave the lower layer untouched.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    pool: PoolConfigFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PoolConfigFile {
    max_workers: Option<usize>,
    env: HashMap<String, String>,
    spawn_args: Option<Vec<String>>,
    terminate_timeout_secs: Option<u64>,
    log_level: Option<String>,
    worker_program: Option<PathBuf>,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    // Load global config
    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    // Load project config
    if let Some(dir) = project_dir {
        let project_path = project_config_path(dir);
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("changeflow").join("settings.json"))
}

/// Get the project config file path under `dir`.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".changeflow").join("settings.json")
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: ConfigFile) {
    let overlay = overlay.pool;
    let pool = &mut base.pool;
    if let Some(n) = overlay.max_workers {
        pool.max_workers = Some(n);
    }
    if let Some(program) = overlay.worker_program {
        pool.worker_program = Some(program);
    }
    if let Some(args) = overlay.spawn_args {
        pool.spawn_args = args;
    }
    if let Some(secs) = overlay.terminate_timeout_secs {
        pool.terminate_timeout_secs = secs;
    }
    if let Some(level) = overlay.log_level {
        pool.log_level = level;
    }
    pool.env.extend(overlay.env);
}

/// Apply `CHANGEFLOW_*` overrides read through `lookup`.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("CHANGEFLOW_MAX_WORKERS") {
        match val.parse() {
            Ok(0) | Err(_) => {
                tracing::warn!(value = %val, "Ignoring invalid CHANGEFLOW_MAX_WORKERS");
            }
            Ok(n) => config.pool.max_workers = Some(n),
        }
    }
    if let Some(val) = lookup("CHANGEFLOW_TERMINATE_TIMEOUT")
        && let Ok(n) = val.parse()
    {
        config.pool.terminate_timeout_secs = n;
    }
    if let Some(val) = lookup("CHANGEFLOW_LOG_LEVEL") {
        config.pool.log_level = val;
    }
    if let Some(val) = lookup("CHANGEFLOW_WORKER_PROGRAM") {
        config.pool.worker_program = Some(PathBuf::from(val));
    }
}
