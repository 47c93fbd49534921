//! Fixed-capacity dispatch engine over a priority queue (C7).
//!
//! A `Scheduler` owns everything reachable from its slot table and its
//! queue until `mark_done` hands a task back out (spec §3, "Ownership
//! summary"). The orchestrator runs two of these: the main scheduler
//! (user policy, user `N`) and a small FCFS status scheduler (spec
//! §4.7).

use crate::error::{Error, Result};
use crate::logging::LogLevel;
use crate::pqueue::{Comparator, PriorityQueue};
use crate::runner;
use crate::task::{Stage, TaggedTask, Timestamp};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use std::path::PathBuf;

struct Slot {
    pid: Pid,
    task: TaggedTask,
}

pub struct Scheduler {
    queue: PriorityQueue,
    slots: Vec<Option<Slot>>,
    out_dir: PathBuf,
}

impl Scheduler {
    pub fn new(cmp: Comparator, n: usize, out_dir: PathBuf) -> Result<Scheduler> {
        if n == 0 || out_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument);
        }
        Ok(Scheduler {
            queue: PriorityQueue::new(cmp),
            slots: (0..n).map(|_| None).collect(),
            out_dir,
        })
    }

    pub fn add(&mut self, task: TaggedTask) {
        self.queue.insert(task);
    }

    pub fn can_schedule_now(&self) -> bool {
        self.slots.iter().any(Option::is_none)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.count()
    }

    /// While the queue is non-empty and a slot is vacant: pops the top
    /// task, stamps DISPATCHED, forks a runner child for it, and records
    /// the child's pid in the slot. Returns the number launched. A fork
    /// failure is diagnosed and the task dropped rather than retried in
    /// a tight loop against what is likely a persistent resource
    /// exhaustion.
    pub fn dispatch_possible(&mut self) -> Result<usize> {
        let mut launched = 0;
        while !self.queue.is_empty() {
            let free = match self.slots.iter().position(Option::is_none) {
                Some(i) => i,
                None => break,
            };
            let mut task = match self.queue.remove_top() {
                Some(t) => t,
                None => break,
            };
            task.set_time(Stage::Dispatched, None);

            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    let code = runner::run(&task, free, &self.out_dir);
                    nix::unistd::_exit(code);
                }
                Ok(ForkResult::Parent { child }) => {
                    self.slots[free] = Some(Slot { pid: child, task });
                    launched += 1;
                }
                Err(e) => {
                    log!(
                        LogLevel::LogError,
                        "fork failed, dropping task {}: {}",
                        task.id(),
                        e
                    );
                    break;
                }
            }
        }
        Ok(launched)
    }

    /// Reaps the slot's child with a blocking `waitpid`, stamps
    /// ENDED/COMPLETED, vacates the slot, and hands ownership of the
    /// task back to the caller. `Error::Range` if `slot` is out of
    /// bounds or already vacant.
    pub fn mark_done(&mut self, slot: usize, time_ended: Timestamp) -> Result<TaggedTask> {
        if slot >= self.slots.len() {
            return Err(Error::Range);
        }
        let occupied = self.slots[slot].take().ok_or(Error::Range)?;
        if let Err(e) = waitpid(occupied.pid, None) {
            log!(
                LogLevel::LogWarn,
                "waitpid on slot {} (pid {}) failed: {}",
                slot,
                occupied.pid,
                e
            );
        }
        let mut task = occupied.task;
        task.set_time(Stage::Ended, Some(time_ended));
        task.set_time(Stage::Completed, None);
        Ok(task)
    }

    pub fn iter_running(&self, mut cb: impl FnMut(&TaggedTask)) {
        for slot in self.slots.iter().flatten() {
            cb(&slot.task);
        }
    }

    /// Arbitrary heap order (spec §4.4, §4.7).
    pub fn iter_queued(&self, mut cb: impl FnMut(&TaggedTask)) {
        for task in self.queue.iter_all() {
            cb(task);
        }
    }
}
