//! `taskord-server` entry point (C13). Parses arguments, prepares the
//! output directory, and hands off to the library's orchestrator loop.
//! All behavior worth testing lives in `taskord::orchestrator` and is
//! exercised without going through `std::env::args`.

use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use structopt::StructOpt;
use taskord::orchestrator::{self, Config};
use taskord::pqueue::{fcfs_order, sjf_order};

#[derive(Copy, Clone, Debug)]
enum Policy {
    Fcfs,
    Sjf,
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Policy, String> {
        match s.to_lowercase().as_str() {
            "fcfs" => Ok(Policy::Fcfs),
            "sjf" => Ok(Policy::Sjf),
            other => Err(format!("unknown policy '{}' (expected 'fcfs' or 'sjf')", other)),
        }
    }
}

#[derive(StructOpt)]
#[structopt(name = "taskord-server", about = "Local task-orchestration server")]
struct ServerOpt {
    /// Directory for the completion log and per-task output files.
    out_dir: PathBuf,
    /// Fixed concurrency cap on the main scheduler.
    n: usize,
    /// Scheduling policy: fcfs or sjf.
    policy: Policy,
}

fn main() {
    let opt = ServerOpt::from_args();

    if let Err(e) = std::fs::create_dir_all(&opt.out_dir) {
        eprintln!(
            "taskord-server: could not create output directory {}: {}",
            opt.out_dir.display(),
            e
        );
        process::exit(1);
    }

    let comparator = match opt.policy {
        Policy::Fcfs => fcfs_order,
        Policy::Sjf => sjf_order,
    };

    let config = Config {
        out_dir: opt.out_dir,
        slot_count: opt.n,
        comparator,
    };

    if let Err(e) = orchestrator::run(config) {
        eprintln!("taskord-server: {}", e);
        process::exit(1);
    }
}
