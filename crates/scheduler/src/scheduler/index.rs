//! Ordered indexes over pending firings and in-flight runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::executor::{RunHandle, RunId, TaskId};

use super::entry::{FireKey, RunningEntry, ScheduledEntry};

/// Priority structure over pending firings.
///
/// Entries are keyed by the total order `(fire_at, nonce, task)`; a side map
/// from task id to its current key supports removal without re-deriving the
/// key from the cron expression. The two maps move in lockstep: every task in
/// the side map has exactly one entry in the tree, and vice versa.
#[derive(Default)]
pub(crate) struct ScheduledIndex {
    by_key: BTreeMap<FireKey, ScheduledEntry>,
    by_task: HashMap<TaskId, FireKey>,
}

impl ScheduledIndex {
    /// Insert `entry`, replacing any existing entry for the same task.
    pub(crate) fn upsert(&mut self, entry: ScheduledEntry) {
        if let Some(old) = self.by_task.remove(&entry.task) {
            self.by_key.remove(&old);
        }
        let key = entry.key();
        self.by_task.insert(entry.task, key);
        self.by_key.insert(key, entry);
    }

    /// Remove the entry for `task`, if any.
    pub(crate) fn remove_by_task(&mut self, task: TaskId) -> Option<ScheduledEntry> {
        let key = self.by_task.remove(&task)?;
        self.by_key.remove(&key)
    }

    /// Return and remove the least entry.
    pub(crate) fn pop_min(&mut self) -> Option<ScheduledEntry> {
        let (key, entry) = self.by_key.pop_first()?;
        self.by_task.remove(&key.task);
        Some(entry)
    }

    /// Unix second of the earliest pending firing.
    pub(crate) fn next_fire_at(&self) -> Option<i64> {
        self.by_key.first_key_value().map(|(key, _)| key.fire_at)
    }

    pub(crate) fn contains(&self, task: TaskId) -> bool {
        self.by_task.contains_key(&task)
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Check that the tree and the side map describe the same set of tasks.
    #[cfg(test)]
    pub(crate) fn assert_coherent(&self) {
        assert_eq!(self.by_key.len(), self.by_task.len());
        for (key, entry) in &self.by_key {
            assert_eq!(entry.key(), *key);
            assert_eq!(self.by_task.get(&entry.task), Some(key));
        }
    }
}

/// Index of in-flight runs keyed by `(task, run)`.
///
/// Ordered so that `list_by_task` and release-time cancellation can range
/// scan a single task's runs.
#[derive(Default)]
pub(crate) struct RunningRegistry {
    by_key: BTreeMap<(TaskId, RunId), RunningEntry>,
}

impl RunningRegistry {
    pub(crate) fn insert(&mut self, entry: RunningEntry) {
        self.by_key.insert((entry.task, entry.run), entry);
    }

    pub(crate) fn remove(&mut self, task: TaskId, run: RunId) -> Option<RunningEntry> {
        self.by_key.remove(&(task, run))
    }

    /// In-flight run ids for `task`, ascending, truncated to `limit`.
    pub(crate) fn list_by_task(&self, task: TaskId, limit: usize) -> Vec<RunId> {
        self.by_key
            .range((task, RunId(0))..=(task, RunId(u64::MAX)))
            .map(|(key, _)| key.1)
            .take(limit)
            .collect()
    }

    /// Remove every entry for `task`, returning the handles so the caller
    /// can cancel them outside the engine lock.
    pub(crate) fn drain_task(&mut self, task: TaskId) -> Vec<Arc<dyn RunHandle>> {
        let keys: Vec<(TaskId, RunId)> = self
            .by_key
            .range((task, RunId(0))..=(task, RunId(u64::MAX)))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter()
            .filter_map(|key| self.by_key.remove(&key))
            .map(|entry| entry.handle)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }
}
