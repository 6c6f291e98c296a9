//! Per-task execution mutexes handed out on demand.
//!
//! Pooled execution and forced `run_now` execution of the same task must never
//! overlap. Rather than widening every task with a mutex it rarely needs, the
//! registry keeps a weak mutex per live task id and hands out strong
//! references, so an entry lives exactly as long as someone is executing (or
//! waiting to execute) the task.

use crate::executor::TaskId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Weak};

pub type ExecMutex = Mutex<()>;

const DEFAULT_CLEANUP_THRESHOLD: usize = 64;
const DEFAULT_SCAN_BUDGET: usize = 16;

#[derive(Debug)]
struct Table {
    entries: BTreeMap<TaskId, Weak<ExecMutex>>,
    // where the next eviction pass resumes
    cursor: Option<TaskId>,
}

#[derive(Debug)]
pub struct SharedMutexRegistry {
    table: Mutex<Table>,
    cleanup_threshold: usize,
    scan_budget: usize,
}

impl SharedMutexRegistry {
    pub fn new(cleanup_threshold: usize, scan_budget: usize) -> Self {
        Self {
            table: Mutex::new(Table {
                entries: BTreeMap::new(),
                cursor: None,
            }),
            cleanup_threshold: cleanup_threshold.max(1),
            scan_budget: scan_budget.max(1),
        }
    }

    /// Returns the execution mutex for `id`, creating it if no live one exists.
    ///
    /// Task ids are never reused, so a stale entry can never hand a dead
    /// task's mutex to a new task.
    pub fn get_or_create(&self, id: TaskId) -> Arc<ExecMutex> {
        let mut table = self.table.lock();

        if let Some(existing) = table.entries.get(&id).and_then(Weak::upgrade) {
            return existing;
        }

        let mutex = Arc::new(Mutex::new(()));
        table.entries.insert(id, Arc::downgrade(&mutex));

        if table.entries.len() > self.cleanup_threshold {
            self.evict_expired(&mut table);
        }

        mutex
    }

    /// Number of entries, live or not yet evicted.
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Scans at most `scan_budget` entries starting at the cursor, wrapping
    // around once, and drops the expired ones.
    fn evict_expired(&self, table: &mut Table) {
        let start = match table.cursor {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };

        let mut scanned: Vec<(TaskId, bool)> = table
            .entries
            .range((start, Bound::Unbounded))
            .take(self.scan_budget)
            .map(|(id, weak)| (*id, weak.strong_count() == 0))
            .collect();

        if scanned.len() < self.scan_budget {
            let remaining = self.scan_budget - scanned.len();
            let upper = match table.cursor {
                Some(id) => Bound::Included(id),
                None => Bound::Unbounded,
            };
            if table.cursor.is_some() {
                scanned.extend(
                    table
                        .entries
                        .range((Bound::Unbounded, upper))
                        .take(remaining)
                        .map(|(id, weak)| (*id, weak.strong_count() == 0)),
                );
            }
        }

        table.cursor = scanned.last().map(|(id, _)| *id);

        let mut evicted = 0usize;
        for (id, expired) in scanned {
            if expired {
                table.entries.remove(&id);
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::trace!(evicted, remaining = table.entries.len(), "evicted expired task mutexes");
        }
    }
}

impl Default for SharedMutexRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CLEANUP_THRESHOLD, DEFAULT_SCAN_BUDGET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_id_shares_mutex_while_alive() {
        let registry = SharedMutexRegistry::default();
        let id = TaskId::next();

        let a = registry.get_or_create(id);
        let b = registry.get_or_create(id);
        assert!(Arc::ptr_eq(&a, &b));

        let _guard = a.lock();
        assert!(b.try_lock().is_none());
    }

    #[test]
    fn test_expired_entry_is_replaced() {
        let registry = SharedMutexRegistry::default();
        let id = TaskId::next();

        drop(registry.get_or_create(id));

        let second = registry.get_or_create(id);
        assert!(second.try_lock().is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_ids_do_not_contend() {
        let registry = SharedMutexRegistry::default();
        let a = registry.get_or_create(TaskId::next());
        let b = registry.get_or_create(TaskId::next());

        let _guard = a.lock();
        assert!(b.try_lock().is_some());
    }

    #[test]
    fn test_eviction_is_bounded_per_pass() {
        let registry = SharedMutexRegistry::new(4, 2);

        // five dead entries
        for _ in 0..5 {
            drop(registry.get_or_create(TaskId::next()));
        }
        // the fifth insert crossed the threshold and scanned two entries
        assert_eq!(registry.len(), 3);

        drop(registry.get_or_create(TaskId::next()));
        assert!(registry.len() <= 4);
    }

    #[test]
    fn test_eviction_keeps_live_entries() {
        let registry = SharedMutexRegistry::new(2, 8);
        let held: Vec<_> = (0..4).map(|_| registry.get_or_create(TaskId::next())).collect();

        drop(registry.get_or_create(TaskId::next()));
        assert!(registry.len() >= held.len());
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_repeated_churn_stays_small() {
        let registry = SharedMutexRegistry::new(8, 4);
        for _ in 0..1000 {
            drop(registry.get_or_create(TaskId::next()));
        }
        assert!(registry.len() <= 8 + 4);
    }
}
