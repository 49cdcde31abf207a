//! NDJSON transport shared by every runtime.
//!
//! Wires a worker's byte streams to the pool: a writer task drains outgoing
//! lines into the worker's input, and a reader task parses the worker's output
//! into [`WorkerEvent`]s. Once output reaches EOF the reader waits for the
//! supervisor to report how the worker ended, so `Exited` is always the last
//! event a worker produces.

use std::future::Future;

use changeflow_core::ndjson::{encode_line, parse_worker_line};
use changeflow_core::PoolMessage;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::runtime::{WorkerEvent, WorkerEventKind, WorkerEvents, WorkerLink};
use super::{TerminationReason, WorkerId};
use crate::error::PoolError;

/// [`WorkerLink`] backed by a conduit.
pub(crate) struct ConduitLink {
    worker: WorkerId,
    lines: mpsc::UnboundedSender<String>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerLink for ConduitLink {
    fn send(&mut self, message: &PoolMessage) -> Result<(), PoolError> {
        self.lines
            .send(encode_line(message))
            .map_err(|_| PoolError::ChannelClosed {
                worker: self.worker,
            })
    }

    fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

/// Connect a worker's streams to the pool.
///
/// `supervise` receives the kill signal and resolves once the worker has
/// ended, with the reason it ended.
pub(crate) fn open<R, W, S, F>(
    worker: WorkerId,
    output: R,
    input: W,
    events: WorkerEvents,
    supervise: S,
) -> ConduitLink
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: FnOnce(oneshot::Receiver<()>) -> F,
    F: Future<Output = TerminationReason> + Send + 'static,
{
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

    // Writer task. Ends when the link is dropped, which closes the worker's input.
    tokio::spawn(async move {
        let mut input = input;
        while let Some(line) = line_rx.recv().await {
            if let Err(e) = write_line(&mut input, &line).await {
                debug!(worker_id = %worker, error = %e, "Worker input closed");
                break;
            }
        }
        let _ = input.shutdown().await;
    });

    let (kill_tx, kill_rx) = oneshot::channel();
    let exit = tokio::spawn(supervise(kill_rx));

    // Reader task
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let kind = match parse_worker_line(&line) {
                        Ok(message) => WorkerEventKind::Message(message),
                        Err(e) => WorkerEventKind::Malformed(e.to_string()),
                    };
                    if events.send(WorkerEvent { worker, kind }).is_err() {
                        debug!(worker_id = %worker, "Pool gone, dropping worker output");
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(worker_id = %worker, error = %e, "Failed to read worker output");
                    break;
                }
            }
        }

        let reason = exit.await.unwrap_or_else(|e| {
            warn!(worker_id = %worker, error = %e, "Worker supervisor failed");
            TerminationReason::Unknown
        });
        let _ = events.send(WorkerEvent {
            worker,
            kind: WorkerEventKind::Exited(reason),
        });
    });

    ConduitLink {
        worker,
        lines: line_tx,
        kill: Some(kill_tx),
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use changeflow_core::{Job, WorkerMessage};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for worker event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn forwards_messages_then_exit() {
        let (pool_side, worker_side) = tokio::io::duplex(1024);
        let (pool_read, pool_write) = tokio::io::split(pool_side);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel::<TerminationReason>();

        let mut link = open(WorkerId(7), pool_read, pool_write, events_tx, move |_kill| async move {
            done_rx.await.unwrap_or(TerminationReason::Unknown)
        });

        let (worker_read, mut worker_write) = tokio::io::split(worker_side);
        let mut worker_lines = BufReader::new(worker_read).lines();

        link.send(&PoolMessage::Job(Job::Available { path: "/a".into() }))
            .unwrap();
        let line = worker_lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"job":{"path":"/a","type":"available"},"kind":"job"}"#);

        worker_write.write_all(b"{\"kind\":\"ready\"}\n\nnot-json\n").await.unwrap();
        let event = next_event(&mut events_rx).await;
        assert_eq!(event.worker, WorkerId(7));
        assert!(matches!(event.kind, WorkerEventKind::Message(WorkerMessage::Ready)));
        let event = next_event(&mut events_rx).await;
        assert!(matches!(event.kind, WorkerEventKind::Malformed(_)));

        drop(worker_write);
        drop(worker_lines);
        done_tx.send(TerminationReason::Exited(0)).unwrap();
        let event = next_event(&mut events_rx).await;
        assert!(matches!(
            event.kind,
            WorkerEventKind::Exited(TerminationReason::Exited(0))
        ));
    }

    #[tokio::test]
    async fn kill_reaches_supervisor() {
        let (pool_side, worker_side) = tokio::io::duplex(1024);
        let (pool_read, pool_write) = tokio::io::split(pool_side);
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let mut link = open(WorkerId(1), pool_read, pool_write, events_tx, move |kill| async move {
            let _ = kill.await;
            drop(worker_side);
            TerminationReason::Killed
        });

        link.kill();
        let event = next_event(&mut events_rx).await;
        assert!(matches!(
            event.kind,
            WorkerEventKind::Exited(TerminationReason::Killed)
        ));
    }

    #[tokio::test]
    async fn send_after_input_closed_fails() {
        let (pool_side, worker_side) = tokio::io::duplex(16);
        let (pool_read, pool_write) = tokio::io::split(pool_side);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        drop(worker_side);

        let mut link = open(WorkerId(2), pool_read, pool_write, events_tx, |_kill| async {
            TerminationReason::Exited(0)
        });

        // The first write fails in the writer task, which then drops its receiver.
        let _ = link.send(&PoolMessage::Stop);
        let mut failed = false;
        for _ in 0..100 {
            if link.send(&PoolMessage::Stop).is_err() {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(failed, "link should report the closed channel");
    }
}
