//! End-to-end tests against the built `changeflow` binary.

#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use changeflow_pool::worker::{ProcessRuntime, WORKER_SUBCOMMAND};
use changeflow_pool::{ChangeResource, PoolOptions, WorkerPool};

const BIN: &str = env!("CARGO_BIN_EXE_changeflow");
const TIMEOUT: Duration = Duration::from_secs(20);

/// Handler script: appends each job to `$CHANGEFLOW_TEST_LOG`, fails
/// `delete` jobs.
fn write_handler(dir: &Path) -> PathBuf {
    let path = dir.join("handler.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         cat >> \"$CHANGEFLOW_TEST_LOG\"\n\
         echo \"handled $CHANGEFLOW_JOB_TYPE\"\n\
         [ \"$CHANGEFLOW_JOB_TYPE\" != delete ]\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn read_log(path: &Path) -> Vec<String> {
    let mut lines: Vec<String> = std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect();
    lines.sort();
    lines
}

struct Counted {
    id: &'static str,
    releases: Arc<AtomicUsize>,
}

impl ChangeResource for Counted {
    fn serialize(&self) -> String {
        self.id.to_string()
    }

    fn release(self: Box<Self>) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn pool_runs_jobs_in_worker_processes() {
    let dir = tempfile::tempdir().unwrap();
    let handler = write_handler(dir.path());
    let log = dir.path().join("jobs.log");

    let options = PoolOptions::default()
        .with_max_workers(2)
        .with_env("CHANGEFLOW_TEST_LOG", log.to_string_lossy())
        .with_env("CHANGEFLOW_LOG_LEVEL", "warn");
    let runtime = ProcessRuntime::new(BIN).with_base_args([WORKER_SUBCOMMAND]);
    let pool = WorkerPool::with_runtime(handler.to_string_lossy(), options, Arc::new(runtime));

    let releases = Arc::new(AtomicUsize::new(0));
    pool.notify_available("/db/main.db");
    pool.notify_change(Counted {
        id: "c1",
        releases: Arc::clone(&releases),
    });
    pool.notify_delete(Counted {
        id: "d1",
        releases: Arc::clone(&releases),
    });

    let mut stats = pool.watch_stats();
    let snapshot = tokio::time::timeout(TIMEOUT, stats.wait_for(|s| s.completed_total == 3))
        .await
        .expect("jobs did not complete")
        .unwrap()
        .clone();
    assert!(snapshot.spawned_total <= 2);
    assert_eq!(snapshot.failed_jobs_total, 1);
    assert_eq!(snapshot.faults_total, 0);
    assert_eq!(releases.load(Ordering::SeqCst), 2);

    tokio::time::timeout(TIMEOUT, pool.stop()).await.unwrap();
    let stats = pool.stats();
    assert!(stats.shutdown_complete);
    assert_eq!(stats.terminated_total, stats.spawned_total);

    assert_eq!(
        read_log(&log),
        [
            r#"{"changeId":"c1","type":"change"}"#,
            r#"{"changeId":"d1","type":"delete"}"#,
            r#"{"path":"/db/main.db","type":"available"}"#,
        ]
    );
}

#[test]
fn run_command_processes_stdin_events() {
    let dir = tempfile::tempdir().unwrap();
    let handler = write_handler(dir.path());
    let log = dir.path().join("jobs.log");

    let mut child = Command::new(BIN)
        .args(["run", "--max-workers", "2", "--log-level", "warn", "--handler"])
        .arg(&handler)
        .arg("--project-dir")
        .arg(dir.path())
        .env("CHANGEFLOW_TEST_LOG", &log)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"# feed\nchange a\nchange a\nbogus line\navailable /db/x\n")
        .unwrap();

    let status = child.wait().unwrap();
    assert!(status.success());
    assert_eq!(
        read_log(&log),
        [
            r#"{"changeId":"a","type":"change"}"#,
            r#"{"changeId":"a","type":"change"}"#,
            r#"{"path":"/db/x","type":"available"}"#,
        ]
    );
}

#[test]
fn run_command_rejects_missing_handler() {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(BIN)
        .args(["run", "--handler"])
        .arg(dir.path().join("missing.sh"))
        .arg("--project-dir")
        .arg(dir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn worker_subcommand_speaks_the_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let handler = write_handler(dir.path());
    let log = dir.path().join("jobs.log");

    let mut child = Command::new(BIN)
        .arg(WORKER_SUBCOMMAND)
        .env("CHANGEFLOW_TEST_LOG", &log)
        .env("CHANGEFLOW_LOG_LEVEL", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let input = format!(
        "{{\"kind\":\"load\",\"module\":\"{}\"}}\n\
         {{\"kind\":\"job\",\"job\":{{\"type\":\"change\",\"changeId\":\"x\"}}}}\n\
         {{\"kind\":\"stop\"}}\n",
        handler.display()
    );
    child.stdin.take().unwrap().write_all(input.as_bytes()).unwrap();

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    // The handler's own stdout never reaches the protocol stream.
    assert_eq!(
        String::from_utf8(output.stdout).unwrap(),
        "{\"kind\":\"ready\"}\n{\"changeId\":\"x\",\"kind\":\"done\"}\n"
    );
}
