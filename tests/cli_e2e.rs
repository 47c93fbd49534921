//! Black-box coverage for scenarios 1-3 and 6 of spec §8, driving the real
//! `taskord-server`/`taskord-client` binaries over the real named-pipe
//! transport (C1), exactly the way a human operator would.
//!
//! The server FIFO lives at a single well-known path
//! (`ipc::SERVER_FIFO_PATH`), so only one live server may exist on the
//! machine at a time. Rust's test harness runs `#[test]` functions in
//! parallel threads within one binary by default, so every test in this
//! file takes `FIFO_LOCK` before touching the FIFO, serializing the two
//! functions below against each other.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread::sleep;
use std::time::{Duration, Instant};

const SERVER_FIFO_PATH: &str = "/tmp/orchestrator.fifo";

static FIFO_LOCK: Mutex<()> = Mutex::new(());

struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
        let _ = fs::remove_file(SERVER_FIFO_PATH);
    }
}

fn wait_for_path(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !path.exists() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {} to appear", path.display());
        }
        sleep(Duration::from_millis(20));
    }
}

fn read_when_ready(path: &Path, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(mut f) = fs::File::open(path) {
            let mut buf = Vec::new();
            if f.read_to_end(&mut buf).is_ok() && !buf.is_empty() {
                return buf;
            }
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {} to have content", path.display());
        }
        sleep(Duration::from_millis(20));
    }
}

#[test]
fn submit_pipeline_and_parse_failure_scenarios() {
    let _fifo_lock = FIFO_LOCK.lock().unwrap_or_else(|p| p.into_inner());

    // A prior crashed run of this test can leave a stale FIFO behind;
    // a fresh `taskord-server` would otherwise exit 1 with FatalStartup.
    let _ = fs::remove_file(SERVER_FIFO_PATH);

    let out_dir = tempfile::tempdir().unwrap();
    let server = Command::new(env!("CARGO_BIN_EXE_taskord-server"))
        .arg(out_dir.path())
        .arg("2")
        .arg("fcfs")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to launch taskord-server");
    let _guard = ServerGuard(server);

    wait_for_path(Path::new(SERVER_FIFO_PATH), Duration::from_secs(2));

    // Scenario 1: single program.
    let out = Command::new(env!("CARGO_BIN_EXE_taskord-client"))
        .args(["execute", "100", "-u", "echo hi"])
        .output()
        .expect("failed to launch taskord-client");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Task 1 scheduled"));
    assert_eq!(
        read_when_ready(&out_dir.path().join("1.out"), Duration::from_secs(2)),
        b"hi\n"
    );

    // Scenario 2: pipeline.
    let out = Command::new(env!("CARGO_BIN_EXE_taskord-client"))
        .args(["execute", "100", "-p", "printf ab | tr a X"])
        .output()
        .expect("failed to launch taskord-client");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Task 2 scheduled"));
    assert_eq!(
        read_when_ready(&out_dir.path().join("2.out"), Duration::from_secs(2)),
        b"Xb"
    );

    // Scenario 3: parse failure.
    let out = Command::new(env!("CARGO_BIN_EXE_taskord-client"))
        .args(["execute", "100", "-u", "a | b"])
        .output()
        .expect("failed to launch taskord-client");
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("Parsing failure!"));

    // Give the orchestrator a moment to persist both completions before
    // a status snapshot is requested.
    sleep(Duration::from_millis(200));

    let out = Command::new(env!("CARGO_BIN_EXE_taskord-client"))
        .arg("status")
        .output()
        .expect("failed to launch taskord-client");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("DONE id=1"), "status output was:\n{}", stdout);
    assert!(stdout.contains("DONE id=2"), "status output was:\n{}", stdout);
    // The parse failure in scenario 3 never reached the scheduler, so no
    // id=3 log record should exist.
    assert!(!stdout.contains("id=3"), "status output was:\n{}", stdout);
}

// Scenario 6: a `status` snapshot taken while one task is running and
// another is still queued behind it, on a single-slot scheduler so the
// second submission cannot dispatch until the first finishes.
#[test]
fn status_reports_executing_and_queued_tasks() {
    let _fifo_lock = FIFO_LOCK.lock().unwrap_or_else(|p| p.into_inner());

    let _ = fs::remove_file(SERVER_FIFO_PATH);

    let out_dir = tempfile::tempdir().unwrap();
    let server = Command::new(env!("CARGO_BIN_EXE_taskord-server"))
        .arg(out_dir.path())
        .arg("1")
        .arg("fcfs")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to launch taskord-server");
    let _guard = ServerGuard(server);

    wait_for_path(Path::new(SERVER_FIFO_PATH), Duration::from_secs(2));

    let out = Command::new(env!("CARGO_BIN_EXE_taskord-client"))
        .args(["execute", "2000", "-u", "sleep 1"])
        .output()
        .expect("failed to launch taskord-client");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Task 1 scheduled"));

    // The single slot is occupied by the sleep above, so this one queues.
    let out = Command::new(env!("CARGO_BIN_EXE_taskord-client"))
        .args(["execute", "100", "-u", "echo hi"])
        .output()
        .expect("failed to launch taskord-client");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains("Task 2 scheduled"));

    let out = Command::new(env!("CARGO_BIN_EXE_taskord-client"))
        .arg("status")
        .output()
        .expect("failed to launch taskord-client");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("EXECUTING id=1"), "status output was:\n{}", stdout);
    assert!(stdout.contains("QUEUED id=2"), "status output was:\n{}", stdout);
}
