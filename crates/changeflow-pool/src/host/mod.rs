//! Worker-side protocol host.
//!
//! [`serve`] is the body of every worker, whether it runs as a child process
//! (`changeflow worker`) or as a task inside the pool's runtime. It performs
//! the `load`/`ready` handshake, then runs one job per `job` message and
//! answers each with `done`. `stop` or end of input ends the loop.

mod error;
mod handler;

pub use error::HostError;
pub use handler::{ExecLoader, HandlerLoader, HandlerRegistry, JobHandler, JobResult};

use changeflow_core::ndjson::{encode_line, parse_pool_line};
use changeflow_core::{PoolMessage, WorkerMessage};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Run the worker protocol until told to stop or input closes.
pub async fn serve<R, W>(reader: R, mut writer: W, loader: &dyn HandlerLoader) -> Result<(), HostError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();

    let handler = loop {
        let Some(line) = lines.next_line().await? else {
            return Err(HostError::Handshake("input closed before module load".into()));
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_pool_line(&line)? {
            PoolMessage::Load { module } => {
                let handler = loader.load(&module)?;
                info!(module = %module, "Handler module loaded");
                break handler;
            }
            PoolMessage::Stop => return Ok(()),
            PoolMessage::Job(job) => {
                return Err(HostError::Handshake(format!(
                    "received {} job before module load",
                    job.kind()
                )));
            }
        }
    };
    write_message(&mut writer, &WorkerMessage::Ready).await?;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match parse_pool_line(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed pool message");
                continue;
            }
        };
        match message {
            PoolMessage::Job(job) => {
                debug!(kind = job.kind(), change_id = ?job.change_id(), "Running job");
                let reply = match handler(job.clone()).await {
                    Ok(()) => WorkerMessage::done(&job),
                    Err(e) => {
                        warn!(kind = job.kind(), error = %e, "Job handler failed");
                        WorkerMessage::failed(&job, e)
                    }
                };
                write_message(&mut writer, &reply).await?;
            }
            PoolMessage::Stop => {
                debug!("Stop received");
                return Ok(());
            }
            PoolMessage::Load { module } => {
                warn!(module = %module, "Ignoring repeated module load");
            }
        }
    }
    Ok(())
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &WorkerMessage,
) -> Result<(), HostError> {
    let mut line = encode_line(message);
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
