//! Status subprogram entry point (C9).
//!
//! Runs as a procedure task (spec §9, "Dynamic-dispatched task
//! payload") inside a forked child, so it sees a logical snapshot of the
//! log (bounded by the writer's `task_count` at fork time) and of the
//! scheduler's slots/queue at fork time. Consistency with subsequent
//! server state is not required (spec §4.9).

use crate::ipc::Connection;
use crate::logging::LogLevel;
use crate::runner::send_task_done;
use crate::scheduler::Scheduler;
use crate::task::{Stage, TaggedTask, Timestamp};
use crate::tasklog::LogFile;
use crate::wire::{ServerMessage, TaskStatus};
use nix::unistd::Pid;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

/// What the status procedure closure captures. Constructed once per
/// `STATUS` request, before the status scheduler forks it.
///
/// `log_path`/`log_task_count` are carried rather than a shared handle
/// onto the orchestrator's writable `LogFile`: a forked copy of that
/// handle would share the parent's open file description, and hence its
/// seek offset, so the child's replay could race the orchestrator's
/// concurrent log writes. `status::run` opens its own fd from these once
/// it is actually running in the forked child.
pub struct StatusState {
    pub conn: Rc<Connection>,
    pub client_pid: Pid,
    pub log_path: PathBuf,
    pub log_task_count: usize,
    pub scheduler: Rc<RefCell<Scheduler>>,
}

pub fn run(state: &StatusState, slot: usize) -> i32 {
    if let Err(e) = state.conn.server_open_sending(state.client_pid) {
        log!(
            LogLevel::LogError,
            "status: could not open send direction to client {}: {}",
            state.client_pid,
            e
        );
        send_task_done(slot, true, true);
        return 1;
    }

    let mut any_error = false;

    match LogFile::open_snapshot(&state.log_path, state.log_task_count) {
        Ok(mut log) => {
            if log
                .read_all(|task, error| {
                    send_status(&state.conn, TaskStatus::Done, task, error);
                    0
                })
                .is_err()
            {
                any_error = true;
            }
        }
        Err(e) => {
            log!(
                LogLevel::LogError,
                "status: could not open an independent log handle at {}: {}",
                state.log_path.display(),
                e
            );
            any_error = true;
        }
    }

    state
        .scheduler
        .borrow()
        .iter_running(|task| send_status(&state.conn, TaskStatus::Executing, task, false));
    state
        .scheduler
        .borrow()
        .iter_queued(|task| send_status(&state.conn, TaskStatus::Queued, task, false));

    state.conn.server_close_sending();
    send_task_done(slot, true, any_error);
    any_error as i32
}

fn send_status(conn: &Connection, status: TaskStatus, task: &TaggedTask, error: bool) {
    let (time_c2s_fifo, time_waiting, time_executing, time_s2s_fifo) = timing_fields(task);
    let msg = ServerMessage::Status {
        status,
        id: task.id(),
        error,
        time_c2s_fifo,
        time_waiting,
        time_executing,
        time_s2s_fifo,
        command_line: task.command_line().to_vec(),
    };
    let encoded = match msg.encode() {
        Ok(b) => b,
        Err(e) => {
            log!(
                LogLevel::LogWarn,
                "status reply for task {} too long to encode: {}",
                task.id(),
                e
            );
            return;
        }
    };
    if let Err(e) = conn.send(&encoded) {
        log!(LogLevel::LogWarn, "status send for task {} failed: {}", task.id(), e);
    }
}

fn micros(d: Option<Duration>) -> f64 {
    d.map(|d| d.as_secs_f64() * 1e6).unwrap_or(f64::NAN)
}

/// `later - earlier` in microseconds, `NaN` if either endpoint is unset
/// (e.g. a QUEUED task has no DISPATCHED yet).
fn gap(later: Option<Timestamp>, earlier: Option<Timestamp>) -> f64 {
    match (later, earlier) {
        (Some(l), Some(e)) => micros(l.duration_since(e)),
        _ => f64::NAN,
    }
}

/// The four wire timings, each the gap between two adjacent stages of
/// the five-timestamp lifecycle: client-to-server fifo transit, queue
/// wait, execution, and server-to-server (child-to-orchestrator) fifo
/// transit.
fn timing_fields(task: &TaggedTask) -> (f64, f64, f64, f64) {
    let sent = task.time(Stage::Sent);
    let arrived = task.time(Stage::Arrived);
    let dispatched = task.time(Stage::Dispatched);
    let ended = task.time(Stage::Ended);
    let completed = task.time(Stage::Completed);
    (
        gap(arrived, sent),
        gap(dispatched, arrived),
        gap(ended, dispatched),
        gap(completed, ended),
    )
}
