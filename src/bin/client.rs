//! `taskord-client` entry point (C13). Submits a job or requests a
//! status snapshot, prints whatever the server streams back, and maps
//! the outcome onto the exit codes from §6: 0 success, 1 usage or
//! client-side failure, 2 server-reported error.

use nix::unistd::getpid;
use std::process;
use structopt::StructOpt;
use taskord::ipc::{Connection, Role, DEFAULT_MAX_TRIES};
use taskord::task::Timestamp;
use taskord::wire::{ClientMessage, ServerMessage, TaskStatus};

#[derive(StructOpt)]
#[structopt(name = "taskord-client", about = "Submit jobs to / query a taskord-server")]
enum ClientOpt {
    /// Request a snapshot of historical, running, and queued tasks.
    Status,
    /// Submit a command line for execution.
    Execute {
        /// Client-reported expected duration, in milliseconds.
        expected_ms: u32,
        /// Single-program submission: the parsed command must have
        /// exactly one stage.
        #[structopt(short = "u")]
        single: bool,
        /// Pipeline submission: `|`-separated stages are allowed.
        #[structopt(short = "p")]
        pipeline: bool,
        /// The shell-like command line, e.g. `"printf ab | tr a X"`.
        command_line: String,
    },
    /// Print usage information.
    Help,
}

fn main() {
    match ClientOpt::from_args() {
        ClientOpt::Status => run_status(),
        ClientOpt::Execute {
            expected_ms,
            single,
            pipeline,
            command_line,
        } => run_execute(expected_ms, single, pipeline, command_line),
        ClientOpt::Help => {
            ClientOpt::clap().print_help().ok();
            println!();
            process::exit(0);
        }
    }
}

fn connect() -> Connection {
    match Connection::new(Role::Client) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("taskord-client: could not connect to server: {}", e);
            process::exit(1);
        }
    }
}

fn run_execute(expected_ms: u32, single: bool, pipeline: bool, command_line: String) {
    if single == pipeline {
        eprintln!("taskord-client: execute requires exactly one of -u or -p");
        process::exit(1);
    }

    let conn = connect();
    let msg = if single {
        ClientMessage::SendProgram {
            client_pid: getpid(),
            time_sent: Timestamp::now(),
            expected_time_ms: expected_ms,
            command_line: command_line.into_bytes(),
        }
    } else {
        ClientMessage::SendTask {
            client_pid: getpid(),
            time_sent: Timestamp::now(),
            expected_time_ms: expected_ms,
            command_line: command_line.into_bytes(),
        }
    };

    let encoded = match msg.encode() {
        Ok(b) => b,
        Err(e) => {
            eprintln!("taskord-client: command line too long to submit: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = conn.send_retry(&encoded, DEFAULT_MAX_TRIES) {
        eprintln!("taskord-client: could not reach server: {}", e);
        process::exit(1);
    }

    #[derive(Default)]
    struct State {
        reply: Option<ServerMessage>,
    }
    let mut state = State::default();
    if let Err(e) = conn.listen(
        |payload, state: &mut State| {
            if let Ok(m) = ServerMessage::decode(payload) {
                state.reply = Some(m);
            }
        },
        |_state: &mut State| 1,
        &mut state,
    ) {
        eprintln!("taskord-client: {}", e);
        process::exit(1);
    }

    match state.reply {
        Some(ServerMessage::TaskId { id }) => {
            println!("Task {} scheduled", id);
            process::exit(0);
        }
        Some(ServerMessage::Error { message }) => {
            eprintln!("{}", message);
            process::exit(2);
        }
        _ => {
            eprintln!("taskord-client: no reply from server");
            process::exit(1);
        }
    }
}

fn run_status() {
    let conn = connect();
    let msg = ClientMessage::Status { client_pid: getpid() };
    let encoded = msg.encode().expect("STATUS message always fits a frame");
    if let Err(e) = conn.send_retry(&encoded, DEFAULT_MAX_TRIES) {
        eprintln!("taskord-client: could not reach server: {}", e);
        process::exit(1);
    }

    #[derive(Default)]
    struct State {
        saw_error: bool,
    }
    let mut state = State::default();
    if let Err(e) = conn.listen(
        |payload, state: &mut State| match ServerMessage::decode(payload) {
            Ok(ServerMessage::Status {
                status,
                id,
                error,
                time_c2s_fifo,
                time_waiting,
                time_executing,
                time_s2s_fifo,
                command_line,
            }) => {
                let label = match status {
                    TaskStatus::Done => "DONE",
                    TaskStatus::Executing => "EXECUTING",
                    TaskStatus::Queued => "QUEUED",
                };
                println!(
                    "{} id={} error={} c2s_fifo={:.1}us waiting={:.1}us executing={:.1}us s2s_fifo={:.1}us cmd={}",
                    label,
                    id,
                    error,
                    time_c2s_fifo,
                    time_waiting,
                    time_executing,
                    time_s2s_fifo,
                    String::from_utf8_lossy(&command_line)
                );
            }
            Ok(ServerMessage::Error { message }) => {
                eprintln!("{}", message);
                state.saw_error = true;
            }
            _ => {}
        },
        |_state: &mut State| 1,
        &mut state,
    ) {
        eprintln!("taskord-client: {}", e);
        process::exit(1);
    }

    process::exit(if state.saw_error { 2 } else { 0 });
}
