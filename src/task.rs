//! Tagged tasks (C5) and the polymorphic task payload (C3/§3).
//!
//! The source's task handle is an untagged union of "pipeline of
//! programs" vs. "procedure pointer". Spec §9 directs a tagged variant
//! instead; the procedure side is modeled as `Rc<dyn Fn(usize) -> i32>`
//! so "opaque state pointer" becomes an ordinary Rust closure capture
//! (spec §9, "Callback + opaque state pattern": "In a target language
//! with closures, accept a closure directly").

use crate::tokenizer::{self, TokenizeError};
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// A single argv entry. Kept as raw bytes rather than `String` because
/// the wire and tokenizer grammars never require valid UTF-8.
pub type Arg = Vec<u8>;

/// A non-empty argv; first element is the executable name.
pub type Program = Vec<Arg>;

/// A nanosecond reading of `CLOCK_MONOTONIC`. `0` is the canonical unset
/// value (spec §3: "A missing stage is represented by a canonical zero
/// value"). `CLOCK_MONOTONIC` never legitimately reads exactly zero on a
/// running system, so the sentinel is safe in practice.
#[derive(Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const UNSET: Timestamp = Timestamp(0);

    pub fn now() -> Timestamp {
        let ts: TimeSpec = clock_gettime(ClockId::CLOCK_MONOTONIC)
            .expect("CLOCK_MONOTONIC must be available");
        let nanos = ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64;
        Timestamp(nanos.max(1))
    }

    pub fn from_nanos(nanos: u64) -> Timestamp {
        Timestamp(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn is_set(&self) -> bool {
        self.0 != 0
    }

    /// `None` if either endpoint is unset, matching the spec's "lookups
    /// of unset stages fail".
    pub fn duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        if !self.is_set() || !earlier.is_set() {
            return None;
        }
        Some(Duration::from_nanos(self.0.saturating_sub(earlier.0)))
    }
}

/// The five timing stages a task passes through, in the order the
/// invariant in spec §3 requires them to be non-decreasing.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Stage {
    Sent = 0,
    Arrived = 1,
    Dispatched = 2,
    Ended = 3,
    Completed = 4,
}

pub const NUM_STAGES: usize = 5;

/// A procedure task's body: `(slot) -> exit code`. Only ever constructed
/// for the status subprogram (C9); pipeline tasks never populate this
/// variant.
pub type ProcedureFn = Rc<dyn Fn(usize) -> i32>;

#[derive(Clone)]
pub enum Task {
    /// An ordered, non-empty sequence of programs connected by pipes.
    Pipeline(Vec<Program>),
    /// A procedure reference bound to whatever state its closure
    /// captured. Cloning a `Task::Procedure` clones the `Rc`, i.e. it is
    /// "cloned by reference" exactly as spec §3 requires.
    Procedure(ProcedureFn),
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Pipeline(stages) => f.debug_tuple("Pipeline").field(stages).finish(),
            Task::Procedure(_) => f.write_str("Procedure(..)"),
        }
    }
}

impl Task {
    /// Parses a command line into a `Pipeline` task (C3 boundary). A
    /// stage with zero arguments, an unterminated quote, or a trailing
    /// backslash is a parse error.
    pub fn from_command_line(command_line: &[u8]) -> Result<Task, TokenizeError> {
        let stages = tokenizer::tokenize(command_line)?;
        Ok(Task::Pipeline(stages))
    }

    pub fn stage_count(&self) -> usize {
        match self {
            Task::Pipeline(stages) => stages.len(),
            Task::Procedure(_) => 1,
        }
    }
}

/// A placeholder command line recorded for procedure tasks, since they
/// have no real argv to display (spec §3).
pub const PROCEDURE_COMMAND_LINE: &str = "<status>";

#[derive(Clone, Debug)]
pub struct TaggedTask {
    id: u32,
    task: Task,
    command_line: Vec<u8>,
    expected_time_ms: u32,
    times: [Timestamp; NUM_STAGES],
}

impl TaggedTask {
    pub fn new(id: u32, task: Task, command_line: Vec<u8>, expected_time_ms: u32) -> TaggedTask {
        TaggedTask {
            id,
            task,
            command_line,
            expected_time_ms,
            times: [Timestamp::UNSET; NUM_STAGES],
        }
    }

    /// Reconstructs a task read back from the completion log (C6). Its
    /// `Task` payload is a placeholder and is never executed again; the
    /// reconstruction exists only to carry `command_line`/timestamps
    /// back to a `STATUS` reply.
    pub fn from_log_record(
        id: u32,
        command_line: Vec<u8>,
        expected_time_ms: u32,
        times: [Timestamp; NUM_STAGES],
    ) -> TaggedTask {
        TaggedTask {
            id,
            task: Task::Pipeline(vec![vec![b"<logged>".to_vec()]]),
            command_line,
            expected_time_ms,
            times,
        }
    }

    pub fn new_procedure(id: u32, f: ProcedureFn) -> TaggedTask {
        TaggedTask::new(
            id,
            Task::Procedure(f),
            PROCEDURE_COMMAND_LINE.as_bytes().to_vec(),
            0,
        )
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn command_line(&self) -> &[u8] {
        &self.command_line
    }

    pub fn expected_time_ms(&self) -> u32 {
        self.expected_time_ms
    }

    pub fn time(&self, stage: Stage) -> Option<Timestamp> {
        let t = self.times[stage as usize];
        if t.is_set() {
            Some(t)
        } else {
            None
        }
    }

    /// Stamps `stage`. `t = None` stamps with the current monotonic
    /// clock; `t = Some(_)` is used when the timestamp came from another
    /// process (the client's SENT reading, a child's ENDED reading).
    ///
    /// The invariant that a stage is never set earlier than an
    /// already-set later stage is not checked here (spec §4.5): it holds
    /// by construction since the orchestrator only ever stamps stages in
    /// order.
    pub fn set_time(&mut self, stage: Stage, t: Option<Timestamp>) {
        self.times[stage as usize] = t.unwrap_or_else(Timestamp::now);
    }
}
