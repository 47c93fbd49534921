//! Orchestrator loop (C10): the glue between the wire protocol, the two
//! schedulers, and the completion log.
//!
//! Owns the long-lived state for the process lifetime and drives
//! `Connection::listen`. `Rc`-shared state (the connection, the main
//! scheduler) is what the status subprogram's closure captures before its
//! fork (spec §4.9); after fork it sees an independent, copy-on-write
//! snapshot of both, which is exactly the "logical snapshot at fork time"
//! the status subprogram is specified to see. The log is handled
//! differently: the closure captures the log's path and the writer's
//! `task_count` at fork time rather than the writable `LogFile` itself, so
//! the forked child opens its own fd instead of sharing the parent's open
//! file description (and seek offset) across `fork` (see `status::run`).

use crate::error::Result;
use crate::ipc::{Connection, Role, DEFAULT_MAX_TRIES};
use crate::logging::LogLevel;
use crate::pqueue::{fcfs_order, Comparator};
use crate::scheduler::Scheduler;
use crate::status::{self, StatusState};
use crate::task::{ProcedureFn, Stage, Task, TaggedTask, Timestamp};
use crate::tasklog::LogFile;
use crate::wire::{ClientMessage, ServerMessage};
use nix::unistd::Pid;
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

/// Small and fixed per spec §4.7; status traffic is refused rather than
/// queued once this many status tasks are in flight.
const STATUS_SLOT_COUNT: usize = 32;

pub struct Config {
    pub out_dir: PathBuf,
    pub slot_count: usize,
    pub comparator: Comparator,
}

struct State {
    conn: Rc<Connection>,
    log: Rc<RefCell<LogFile>>,
    log_path: PathBuf,
    main_scheduler: Rc<RefCell<Scheduler>>,
    status_scheduler: Rc<RefCell<Scheduler>>,
    next_id: u32,
}

impl State {
    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Opens the send direction to `client_pid`, sends `msg` with
    /// `send_retry`, and releases the send direction on every path.
    fn reply(&self, client_pid: Pid, msg: &ServerMessage) {
        let encoded = match msg.encode() {
            Ok(b) => b,
            Err(e) => {
                log!(LogLevel::LogError, "could not encode reply to {}: {}", client_pid, e);
                return;
            }
        };
        if let Err(e) = self.conn.server_open_sending(client_pid) {
            log!(LogLevel::LogWarn, "could not open send direction to {}: {}", client_pid, e);
            return;
        }
        if let Err(e) = self.conn.send_retry(&encoded, DEFAULT_MAX_TRIES) {
            log!(LogLevel::LogWarn, "reply to {} failed: {}", client_pid, e);
        }
        self.conn.server_close_sending();
    }
}

/// Constructs both schedulers, the write-mode log, and the SERVER
/// connection, then blocks in the receive loop for the life of the
/// process.
pub fn run(config: Config) -> Result<()> {
    let conn = Rc::new(Connection::new(Role::Server)?);
    let log_path = config.out_dir.join("log.bin");
    let log = Rc::new(RefCell::new(LogFile::open(&log_path, true)?));
    let main_scheduler = Rc::new(RefCell::new(Scheduler::new(
        config.comparator,
        config.slot_count,
        config.out_dir.clone(),
    )?));
    let status_scheduler = Rc::new(RefCell::new(Scheduler::new(
        fcfs_order,
        STATUS_SLOT_COUNT,
        config.out_dir,
    )?));

    let mut state = State {
        conn: conn.clone(),
        log,
        log_path,
        main_scheduler,
        status_scheduler,
        next_id: 1,
    };

    let rc = conn.listen(on_message, on_before_block, &mut state)?;
    log!(LogLevel::LogInfo, "orchestrator loop exited with code {}", rc);
    Ok(())
}

fn on_message(payload: &[u8], state: &mut State) {
    let msg = match ClientMessage::decode(payload) {
        Ok(m) => m,
        Err(e) => {
            log!(LogLevel::LogWarn, "dropping malformed client message: {}", e);
            return;
        }
    };
    match msg {
        ClientMessage::SendProgram {
            client_pid,
            time_sent,
            expected_time_ms,
            command_line,
        } => handle_submission(state, client_pid, time_sent, expected_time_ms, command_line, true),
        ClientMessage::SendTask {
            client_pid,
            time_sent,
            expected_time_ms,
            command_line,
        } => handle_submission(state, client_pid, time_sent, expected_time_ms, command_line, false),
        ClientMessage::TaskDone {
            slot,
            time_ended,
            is_status,
            error,
        } => handle_task_done(state, slot as usize, time_ended, is_status, error),
        ClientMessage::Status { client_pid } => handle_status_request(state, client_pid),
    }
}

fn handle_submission(
    state: &mut State,
    client_pid: Pid,
    time_sent: Timestamp,
    expected_time_ms: u32,
    command_line: Vec<u8>,
    single_stage_required: bool,
) {
    let task = match Task::from_command_line(&command_line) {
        Ok(t) if single_stage_required && t.stage_count() != 1 => {
            log!(
                LogLevel::LogInfo,
                "rejecting {}-stage pipeline from {} on the single-program path",
                t.stage_count(),
                client_pid
            );
            reply_parse_failure(state, client_pid);
            return;
        }
        Ok(t) => t,
        Err(e) => {
            log!(LogLevel::LogInfo, "parse failure from {}: {}", client_pid, e);
            reply_parse_failure(state, client_pid);
            return;
        }
    };

    let id = state.allocate_id();
    let mut tagged = TaggedTask::new(id, task, command_line, expected_time_ms);
    tagged.set_time(Stage::Sent, Some(time_sent));
    tagged.set_time(Stage::Arrived, None);
    state.main_scheduler.borrow_mut().add(tagged);
    state.reply(client_pid, &ServerMessage::TaskId { id });
}

fn reply_parse_failure(state: &State, client_pid: Pid) {
    state.reply(
        client_pid,
        &ServerMessage::Error {
            message: "Parsing failure!".to_string(),
        },
    );
}

fn handle_task_done(state: &mut State, slot: usize, time_ended: Timestamp, is_status: bool, error: bool) {
    let scheduler = if is_status { &state.status_scheduler } else { &state.main_scheduler };
    let task = match scheduler.borrow_mut().mark_done(slot, time_ended) {
        Ok(t) => t,
        Err(e) => {
            log!(
                LogLevel::LogWarn,
                "TASK_DONE for unknown slot {} (is_status={}): {}",
                slot,
                is_status,
                e
            );
            return;
        }
    };
    if !is_status {
        if let Err(e) = state.log.borrow_mut().write(&task, error) {
            log!(LogLevel::LogError, "failed to append log record for task {}: {}", task.id(), e);
        }
    }
}

fn handle_status_request(state: &mut State, client_pid: Pid) {
    if !state.status_scheduler.borrow().can_schedule_now() {
        state.reply(
            client_pid,
            &ServerMessage::Error {
                message: "No capacity available!".to_string(),
            },
        );
        return;
    }

    let id = state.allocate_id();
    let status_state = Rc::new(StatusState {
        conn: state.conn.clone(),
        client_pid,
        log_path: state.log_path.clone(),
        log_task_count: state.log.borrow().task_count(),
        scheduler: state.main_scheduler.clone(),
    });
    let procedure: ProcedureFn = Rc::new(move |slot| status::run(&status_state, slot));
    state.status_scheduler.borrow_mut().add(TaggedTask::new_procedure(id, procedure));
    if let Err(e) = state.status_scheduler.borrow_mut().dispatch_possible() {
        log!(LogLevel::LogError, "failed to dispatch status task {}: {}", id, e);
    }
}

fn on_before_block(state: &mut State) -> i32 {
    if let Err(e) = state.main_scheduler.borrow_mut().dispatch_possible() {
        log!(LogLevel::LogError, "dispatch_possible failed: {}", e);
    }
    0
}
