//! changeflow
//!
//! `changeflow run` feeds events read from stdin to a worker pool.
//! `changeflow worker` is the worker process the pool spawns; it is not meant
//! to be run by hand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use changeflow_core::config::{PoolConfig, load_config};
use changeflow_core::tracing_init::init_tracing;
use changeflow_pool::feed::parse_feed_line;
use changeflow_pool::host::{ExecLoader, serve};
use changeflow_pool::worker::{ProcessRuntime, WorkerRuntime};
use changeflow_pool::{PoolOptions, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "changeflow")]
#[command(version, about = "changeflow - dispatch database change notifications to worker processes")]
struct Cli {
    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "CHANGEFLOW_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read events from stdin and dispatch them to a worker pool
    Run(RunArgs),

    /// Serve the worker protocol on stdin/stdout
    #[command(hide = true)]
    Worker {
        /// Extra arguments from the pool's spawn args
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Handler executable, run once per job with the job JSON on stdin
    #[arg(long, env = "CHANGEFLOW_HANDLER")]
    handler: PathBuf,

    /// Maximum concurrent workers (default: one per CPU)
    #[arg(long)]
    max_workers: Option<usize>,

    /// Extra worker environment variable, KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_key_val)]
    env: Vec<(String, String)>,

    /// Extra argument appended to every worker command line (repeatable)
    #[arg(long = "spawn-arg", allow_hyphen_values = true)]
    spawn_args: Vec<String>,

    /// Seconds to wait for a stopping worker before killing it
    #[arg(long)]
    terminate_timeout: Option<u64>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Directory holding `.changeflow/settings.json` (default: current dir)
    #[arg(long)]
    project_dir: Option<PathBuf>,
}

impl RunArgs {
    /// CLI flags take precedence over every config source.
    fn apply(&self, config: &mut PoolConfig) {
        if let Some(n) = self.max_workers {
            config.max_workers = Some(n);
        }
        config.env.extend(self.env.iter().cloned());
        if !self.spawn_args.is_empty() {
            config.spawn_args.clone_from(&self.spawn_args);
        }
        if let Some(secs) = self.terminate_timeout {
            config.terminate_timeout_secs = secs;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args, cli.log_json).await,
        Command::Worker { args } => worker(&args, cli.log_json).await,
    }
}

async fn run(args: RunArgs, log_json: bool) -> anyhow::Result<()> {
    let project_dir = match &args.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let mut config = load_config(Some(&project_dir))?;
    args.apply(&mut config.pool);

    init_tracing(&config.pool.log_level, log_json);

    anyhow::ensure!(
        args.handler.is_file(),
        "Handler {} is not a file",
        args.handler.display()
    );
    let handler = args.handler.to_string_lossy().into_owned();

    let runtime: Arc<dyn WorkerRuntime> = match &config.pool.worker_program {
        Some(program) => Arc::new(ProcessRuntime::new(program)),
        None => Arc::new(ProcessRuntime::current_exe()?),
    };
    let options = PoolOptions::from(&config.pool);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        handler = %handler,
        max_workers = options.max_workers,
        "Starting changeflow"
    );
    let pool = WorkerPool::with_runtime(handler, options, runtime);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => match parse_feed_line(&line) {
                    Ok(Some(event)) => event.submit(&pool),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, line = %line, "Skipping input line"),
                },
                None => {
                    info!("Input closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
                break;
            }
            _ = sigterm_future => {
                info!("Received SIGTERM shutdown signal");
                break;
            }
        }
    }

    pool.stop().await;
    let stats = pool.stats();
    info!(
        spawned = stats.spawned_total,
        completed = stats.completed_total,
        failed = stats.failed_jobs_total,
        faults = stats.faults_total,
        "changeflow stopped"
    );
    Ok(())
}

async fn worker(args: &[String], log_json: bool) -> anyhow::Result<()> {
    let level = std::env::var("CHANGEFLOW_LOG_LEVEL").unwrap_or_else(|_| "info".into());
    init_tracing(&level, log_json);
    if !args.is_empty() {
        tracing::debug!(?args, "Worker arguments ignored");
    }

    let input = BufReader::new(tokio::io::stdin());
    serve(input, tokio::io::stdout(), &ExecLoader).await?;
    Ok(())
}
