//! The waiting task queue, ordered by `(priority, submit_time, taskid,
//! verref)` ascending — lower `priority` values are serviced first (spec
//! §4.3 "Task waiting queue"). The exact tuple and its ascending sense
//! are carried over from `original_source`'s `task_less` comparator
//! rather than assumed from the distilled spec's looser wording (see
//! `SPEC_FULL.md` §C).

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use fusion_core::ids::{TaskId, VerRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub priority: i32,
    pub submit_time: Instant,
    pub taskid: TaskId,
    pub verref: VerRef,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.submit_time.cmp(&other.submit_time))
            .then(self.taskid.cmp(&other.taskid))
            .then(self.verref.cmp(&other.verref))
    }
}

/// A priority-ordered set of waiting tasks. New tasks are inserted at
/// submission; matched tasks are removed on activation (spec §4.3).
#[derive(Debug, Default)]
pub struct TaskWaitingQueue {
    entries: BTreeSet<QueueEntry>,
    by_taskid: HashMap<TaskId, QueueEntry>,
}

impl TaskWaitingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: QueueEntry) {
        self.by_taskid.insert(entry.taskid, entry.clone());
        self.entries.insert(entry);
    }

    pub fn remove(&mut self, taskid: TaskId) -> Option<QueueEntry> {
        let entry = self.by_taskid.remove(&taskid)?;
        self.entries.remove(&entry);
        Some(entry)
    }

    pub fn contains(&self, taskid: TaskId) -> bool {
        self.by_taskid.contains_key(&taskid)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterates in priority order: lowest `priority` first, ties broken
    /// by submit time, then taskid, then verref.
    pub fn iter_in_priority_order(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_core::ids::AssetRef;

    fn entry(priority: i32, taskid: u32, at: Instant) -> QueueEntry {
        QueueEntry {
            priority,
            submit_time: at,
            taskid: TaskId(taskid),
            verref: AssetRef::new(format!("Foo{taskid}")).version(1),
        }
    }

    #[test]
    fn lower_priority_value_is_serviced_first() {
        let now = Instant::now();
        let mut q = TaskWaitingQueue::new();
        q.insert(entry(5, 1, now));
        q.insert(entry(1, 2, now));
        q.insert(entry(3, 3, now));
        let order: Vec<u32> = q.iter_in_priority_order().map(|e| e.taskid.0).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn ties_broken_by_submit_time_then_taskid() {
        let t0 = Instant::now();
        let t1 = t0 + std::time::Duration::from_millis(1);
        let mut q = TaskWaitingQueue::new();
        q.insert(entry(1, 20, t1));
        q.insert(entry(1, 10, t0));
        let order: Vec<u32> = q.iter_in_priority_order().map(|e| e.taskid.0).collect();
        assert_eq!(order, vec![10, 20]);
    }

    #[test]
    fn remove_takes_the_task_out_of_priority_order() {
        let now = Instant::now();
        let mut q = TaskWaitingQueue::new();
        q.insert(entry(1, 1, now));
        q.insert(entry(2, 2, now));
        assert!(q.remove(TaskId(1)).is_some());
        assert!(!q.contains(TaskId(1)));
        assert_eq!(q.len(), 1);
    }
}
