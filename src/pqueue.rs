//! Binary min-heap of tagged tasks with a pluggable comparator (C4).
//!
//! A manual array-backed heap rather than `std::collections::BinaryHeap`,
//! since the comparator here is a runtime value (the scheduler swaps
//! between FCFS and SJF at construction) and not a compile-time `Ord`
//! impl. Spec §4.4 models `insert` as fallible ("fails only on
//! allocation"); Rust's global allocator aborts on OOM rather than
//! returning an error, so `insert` here is infallible and the
//! `Error::OutOfMemory` kind is reachable only at other call sites.

use crate::task::{Stage, TaggedTask};
use std::cmp::Ordering;

pub type Comparator = fn(&TaggedTask, &TaggedTask) -> Ordering;

/// FCFS: order by ARRIVED ascending. Tasks lacking ARRIVED compare equal
/// (spec §4.4: "they should not occur in steady state").
pub fn fcfs_order(a: &TaggedTask, b: &TaggedTask) -> Ordering {
    match (a.time(Stage::Arrived), b.time(Stage::Arrived)) {
        (Some(ta), Some(tb)) => ta.cmp(&tb),
        _ => Ordering::Equal,
    }
}

/// SJF: order by the client-reported `expected_time` ascending.
pub fn sjf_order(a: &TaggedTask, b: &TaggedTask) -> Ordering {
    a.expected_time_ms().cmp(&b.expected_time_ms())
}

#[derive(Clone)]
pub struct PriorityQueue {
    heap: Vec<TaggedTask>,
    cmp: Comparator,
}

impl PriorityQueue {
    pub fn new(cmp: Comparator) -> PriorityQueue {
        PriorityQueue {
            heap: Vec::new(),
            cmp,
        }
    }

    pub fn insert(&mut self, task: TaggedTask) {
        self.heap.push(task);
        let mut i = self.heap.len() - 1;
        while i > 0 {
            let parent = (i - 1) / 2;
            if (self.cmp)(&self.heap[i], &self.heap[parent]) == Ordering::Less {
                self.heap.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    pub fn remove_top(&mut self) -> Option<TaggedTask> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let top = self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        top
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < len && (self.cmp)(&self.heap[left], &self.heap[smallest]) == Ordering::Less {
                smallest = left;
            }
            if right < len && (self.cmp)(&self.heap[right], &self.heap[smallest]) == Ordering::Less
            {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.heap.swap(i, smallest);
            i = smallest;
        }
    }

    /// Arbitrary heap order, not sorted (spec §3: "callers accept this").
    pub fn iter_all(&self) -> impl Iterator<Item = &TaggedTask> {
        self.heap.iter()
    }

    pub fn count(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn task_with_expected(id: u32, expected_ms: u32) -> TaggedTask {
        TaggedTask::new(
            id,
            Task::Pipeline(vec![vec![b"echo".to_vec()]]),
            b"echo".to_vec(),
            expected_ms,
        )
    }

    fn task_with_arrival(id: u32, nanos: u64) -> TaggedTask {
        let mut t = task_with_expected(id, 0);
        t.set_time(Stage::Arrived, Some(crate::task::Timestamp::from_nanos(nanos)));
        t
    }

    #[test]
    fn sjf_pops_shortest_expected_first() {
        let mut q = PriorityQueue::new(sjf_order);
        q.insert(task_with_expected(1, 99));
        q.insert(task_with_expected(2, 1));
        q.insert(task_with_expected(3, 50));
        assert_eq!(q.remove_top().unwrap().id(), 2);
        assert_eq!(q.remove_top().unwrap().id(), 3);
        assert_eq!(q.remove_top().unwrap().id(), 1);
        assert!(q.remove_top().is_none());
    }

    #[test]
    fn fcfs_pops_earliest_arrival_first() {
        let mut q = PriorityQueue::new(fcfs_order);
        q.insert(task_with_arrival(1, 300));
        q.insert(task_with_arrival(2, 100));
        q.insert(task_with_arrival(3, 200));
        assert_eq!(q.remove_top().unwrap().id(), 2);
        assert_eq!(q.remove_top().unwrap().id(), 3);
        assert_eq!(q.remove_top().unwrap().id(), 1);
    }

    #[test]
    fn count_tracks_insertions_and_removals() {
        let mut q = PriorityQueue::new(sjf_order);
        assert_eq!(q.count(), 0);
        q.insert(task_with_expected(1, 5));
        q.insert(task_with_expected(2, 5));
        assert_eq!(q.count(), 2);
        q.remove_top();
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn iter_all_visits_every_element_regardless_of_order() {
        let mut q = PriorityQueue::new(sjf_order);
        q.insert(task_with_expected(1, 3));
        q.insert(task_with_expected(2, 1));
        q.insert(task_with_expected(3, 2));
        let mut ids: Vec<u32> = q.iter_all().map(|t| t.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
