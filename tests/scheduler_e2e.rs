//! End-to-end coverage for the scheduler/runner/log wiring (C6/C7/C8):
//! real `fork`+`execvp` subprocesses, real pipe-connected stages, real
//! output files, reaped through the same `dispatch_possible`/`mark_done`
//! pair the orchestrator loop uses. Exercises scenarios 1/2 from spec §8
//! without going through the named-pipe client/server transport, whose
//! well-known FIFO path is process-global and not test-isolated.

use std::fs;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::{Duration, Instant};

use taskord::pqueue::fcfs_order;
use taskord::scheduler::Scheduler;
use taskord::task::{Stage, Task, TaggedTask, Timestamp};

fn scheduler_in(out_dir: PathBuf, n: usize) -> Scheduler {
    Scheduler::new(fcfs_order, n, out_dir).unwrap()
}

fn submitted_task(id: u32, command_line: &str) -> TaggedTask {
    let task = Task::from_command_line(command_line.as_bytes()).unwrap();
    let mut tagged = TaggedTask::new(id, task, command_line.as_bytes().to_vec(), 100);
    tagged.set_time(Stage::Sent, None);
    tagged.set_time(Stage::Arrived, None);
    tagged
}

/// Polls for a file to reach a stable (non-empty) size, since the child
/// that writes it is reaped asynchronously by the test, not waited on
/// directly. `mark_done` itself blocks on `waitpid`, so by the time it
/// returns the writing child is already gone and the file is final; this
/// helper only guards against this test's own scheduling jitter.
fn read_when_ready(path: &std::path::Path) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(bytes) = fs::read(path) {
            return bytes;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {} to appear", path.display());
        }
        sleep(Duration::from_millis(20));
    }
}

#[test]
fn single_program_writes_output_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let mut sched = scheduler_in(dir.path().to_path_buf(), 2);

    sched.add(submitted_task(1, "echo hi"));
    assert_eq!(sched.dispatch_possible().unwrap(), 1);

    let before = Timestamp::now();
    let task = sched.mark_done(0, before).unwrap();

    assert_eq!(task.id(), 1);
    assert!(task.time(Stage::Dispatched).is_some());
    assert_eq!(task.time(Stage::Ended), Some(before));
    assert!(task.time(Stage::Completed).is_some());
    assert!(task.time(Stage::Dispatched).unwrap() <= task.time(Stage::Ended).unwrap());

    let out = read_when_ready(&dir.path().join("1.out"));
    assert_eq!(out, b"hi\n");
}

#[test]
fn pipeline_connects_stdout_to_stdin_across_stages() {
    let dir = tempfile::tempdir().unwrap();
    let mut sched = scheduler_in(dir.path().to_path_buf(), 1);

    sched.add(submitted_task(2, "printf ab | tr a X"));
    assert_eq!(sched.dispatch_possible().unwrap(), 1);
    sched.mark_done(0, Timestamp::now()).unwrap();

    let out = read_when_ready(&dir.path().join("2.out"));
    assert_eq!(out, b"Xb");
}

#[test]
fn nonzero_exit_is_reported_as_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut sched = scheduler_in(dir.path().to_path_buf(), 1);

    sched.add(submitted_task(3, "false"));
    assert_eq!(sched.dispatch_possible().unwrap(), 1);
    sched.mark_done(0, Timestamp::now()).unwrap();

    // `false` always exits 1; the runner writes nothing to stdout, but
    // the point under test is that the scheduler reaps it cleanly and a
    // log write downstream would see error=true. The runner reports the
    // error bit over the wire, which this test cannot observe without
    // the IPC transport, so it only checks that reaping succeeded and
    // the vacated slot can be reused.
    sched.add(submitted_task(4, "echo again"));
    assert_eq!(sched.dispatch_possible().unwrap(), 1);
    sched.mark_done(0, Timestamp::now()).unwrap();
    let out = read_when_ready(&dir.path().join("4.out"));
    assert_eq!(out, b"again\n");
}

#[test]
fn dispatch_possible_respects_slot_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let mut sched = scheduler_in(dir.path().to_path_buf(), 1);

    sched.add(submitted_task(5, "echo first"));
    sched.add(submitted_task(6, "echo second"));

    assert_eq!(sched.dispatch_possible().unwrap(), 1);
    assert_eq!(sched.queued_count(), 1);
    assert!(!sched.can_schedule_now());

    sched.mark_done(0, Timestamp::now()).unwrap();
    assert!(sched.can_schedule_now());

    assert_eq!(sched.dispatch_possible().unwrap(), 1);
    assert_eq!(sched.queued_count(), 0);
    sched.mark_done(0, Timestamp::now()).unwrap();

    let first = read_when_ready(&dir.path().join("5.out"));
    let second = read_when_ready(&dir.path().join("6.out"));
    assert_eq!(first, b"first\n");
    assert_eq!(second, b"second\n");
}

#[test]
fn sjf_orders_queued_tasks_by_expected_time() {
    use taskord::pqueue::sjf_order;

    let dir = tempfile::tempdir().unwrap();
    let mut sched = Scheduler::new(sjf_order, 1, dir.path().to_path_buf()).unwrap();

    // id=1 occupies the single slot first (longer expected time is
    // irrelevant once already dispatched); ids 2 and 3 queue behind it
    // and should come out shortest-expected-first.
    let mut long_running = submitted_task(1, "echo hold");
    long_running.set_time(Stage::Arrived, None);
    sched.add(long_running);
    assert_eq!(sched.dispatch_possible().unwrap(), 1);

    let mut t2 = TaggedTask::new(2, Task::from_command_line(b"echo slow").unwrap(), b"echo slow".to_vec(), 90);
    t2.set_time(Stage::Arrived, None);
    let mut t3 = TaggedTask::new(3, Task::from_command_line(b"echo fast").unwrap(), b"echo fast".to_vec(), 10);
    t3.set_time(Stage::Arrived, None);
    sched.add(t2);
    sched.add(t3);

    sched.mark_done(0, Timestamp::now()).unwrap();
    assert_eq!(sched.dispatch_possible().unwrap(), 1);
    let next = sched.mark_done(0, Timestamp::now()).unwrap();
    assert_eq!(next.id(), 3, "shortest expected_time should dispatch first");
}
