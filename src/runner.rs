//! Task-runner subprocess entry point (C8).
//!
//! Runs inside a forked child owned by a scheduler slot. A procedure
//! task (the status subprogram) is simply invoked; a pipeline task is
//! spawned stage by stage, each stage's stdout feeding the next stage's
//! stdin via a pipe, with stdout of the last stage and stderr of every
//! stage redirected to per-task output files. Fd-closing discipline is
//! strict (spec §4.8): a leaked pipe writer deadlocks the reader.

use crate::ipc::{ChildSender, DEFAULT_MAX_TRIES};
use crate::logging::LogLevel;
use crate::task::{Program, Task, TaggedTask, Timestamp};
use crate::wire::ClientMessage;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, pipe, ForkResult};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::Path;

/// Runs `task` in the current (already forked) process and returns the
/// exit code the caller should `_exit` with. Reports the corresponding
/// `TASK_DONE` before returning.
pub fn run(task: &TaggedTask, slot: usize, out_dir: &Path) -> i32 {
    match task.task() {
        Task::Procedure(f) => f(slot),
        Task::Pipeline(stages) => run_pipeline(task.id(), stages, slot, out_dir),
    }
}

fn open_output_fd(path: &Path, fallback: RawFd) -> RawFd {
    match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o640)
        .open(path)
    {
        Ok(f) => f.into_raw_fd(),
        Err(e) => {
            log!(
                LogLevel::LogWarn,
                "could not open {} ({}); falling back to the inherited descriptor",
                path.display(),
                e
            );
            fallback
        }
    }
}

fn run_pipeline(id: u32, stages: &[Program], slot: usize, out_dir: &Path) -> i32 {
    let out_fd = open_output_fd(&out_dir.join(format!("{}.out", id)), libc::STDOUT_FILENO);
    let err_fd = open_output_fd(&out_dir.join(format!("{}.err", id)), libc::STDERR_FILENO);

    let n = stages.len();
    let mut prev_read: Option<RawFd> = None;
    let mut child_pids = Vec::with_capacity(n);
    let mut any_error = false;

    for (i, argv) in stages.iter().enumerate() {
        let is_last = i == n - 1;
        let (pipe_read, pipe_write) = if is_last {
            (None, None)
        } else {
            match pipe() {
                Ok((r, w)) => (Some(r), Some(w)),
                Err(e) => {
                    log!(LogLevel::LogError, "pipe() failed for stage {}: {}", i, e);
                    any_error = true;
                    break;
                }
            }
        };

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                // `SIGPIPE` is ignored process-wide by the orchestrator
                // (`ipc::Connection::new`), and an ignored disposition
                // survives `execve`. Left as-is, a stage that never
                // checks `write`'s return value (e.g. `yes`) spins
                // forever on `EPIPE` once the next stage exits, instead
                // of dying the normal way a shell pipeline would.
                unsafe {
                    let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
                }
                if let Some(prev) = prev_read {
                    let _ = dup2(prev, libc::STDIN_FILENO);
                } else {
                    let _ = close(libc::STDIN_FILENO);
                }
                if let Some(w) = pipe_write {
                    let _ = dup2(w, libc::STDOUT_FILENO);
                } else {
                    let _ = dup2(out_fd, libc::STDOUT_FILENO);
                }
                let _ = dup2(err_fd, libc::STDERR_FILENO);

                if let Some(prev) = prev_read {
                    if prev != libc::STDIN_FILENO {
                        let _ = close(prev);
                    }
                }
                if let Some(r) = pipe_read {
                    let _ = close(r);
                }
                if let Some(w) = pipe_write {
                    if w != libc::STDOUT_FILENO {
                        let _ = close(w);
                    }
                }
                if out_fd > libc::STDERR_FILENO {
                    let _ = close(out_fd);
                }
                if err_fd > libc::STDERR_FILENO && err_fd != out_fd {
                    let _ = close(err_fd);
                }

                let msg = exec_stage(argv);
                let _ = writeln!(std::io::stderr(), "taskord: {}", msg);
                nix::unistd::_exit(1);
            }
            Ok(ForkResult::Parent { child }) => {
                child_pids.push(child);
                if let Some(prev) = prev_read {
                    let _ = close(prev);
                }
                if let Some(w) = pipe_write {
                    let _ = close(w);
                }
                prev_read = pipe_read;
            }
            Err(e) => {
                log!(LogLevel::LogError, "fork failed for stage {}: {}", i, e);
                if let Some(r) = pipe_read {
                    let _ = close(r);
                }
                if let Some(w) = pipe_write {
                    let _ = close(w);
                }
                if let Some(prev) = prev_read {
                    let _ = close(prev);
                }
                any_error = true;
                prev_read = None;
                break;
            }
        }
    }

    if out_fd > libc::STDERR_FILENO {
        let _ = close(out_fd);
    }
    if err_fd > libc::STDERR_FILENO && err_fd != out_fd {
        let _ = close(err_fd);
    }

    for pid in child_pids {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                if code != 0 {
                    any_error = true;
                }
            }
            Ok(_) => any_error = true,
            Err(e) => {
                log!(LogLevel::LogWarn, "waitpid on pipeline stage pid {} failed: {}", pid, e);
                any_error = true;
            }
        }
    }

    send_task_done(slot, false, any_error);
    any_error as i32
}

fn exec_stage(argv: &Program) -> String {
    let cstrings: std::result::Result<Vec<CString>, _> =
        argv.iter().map(|a| CString::new(a.clone())).collect();
    let cstrings = match cstrings {
        Ok(c) => c,
        Err(e) => return format!("invalid argv (embedded NUL byte): {}", e),
    };
    if cstrings.is_empty() {
        return "empty argv".to_string();
    }
    match execvp(&cstrings[0], &cstrings) {
        Ok(never) => match never {},
        Err(e) => format!("execvp({:?}) failed: {}", cstrings[0], e),
    }
}

/// Reports a `TASK_DONE` to the orchestrator. Shared with the status
/// subprogram (C9), which reports the same way with `is_status = true`.
pub(crate) fn send_task_done(slot: usize, is_status: bool, error: bool) {
    let msg = ClientMessage::TaskDone {
        slot: slot as u32,
        time_ended: Timestamp::now(),
        is_status,
        error,
    };
    let encoded = match msg.encode() {
        Ok(b) => b,
        Err(e) => {
            log!(LogLevel::LogError, "failed to encode TASK_DONE: {}", e);
            return;
        }
    };
    match ChildSender::connect() {
        Ok(mut sender) => {
            if let Err(e) = sender.send_retry(&encoded, DEFAULT_MAX_TRIES) {
                log!(LogLevel::LogError, "TASK_DONE send_retry exhausted: {}", e);
            }
        }
        Err(e) => log!(
            LogLevel::LogError,
            "could not connect to server fifo to report completion: {}",
            e
        ),
    }
}
