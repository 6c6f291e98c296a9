//! Ordered task bookkeeping: queued, reserved, running and pending removal.
//!
//! `TaskQueue` does no locking of its own; the scheduler keeps it behind its
//! single state mutex. Every operation here is O(log n) except
//! [`TaskQueue::overdue`], which is a diagnostic scan.

use crate::executor::{TaskHandle, TaskId};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// `f64` priority with a total order (`f64::total_cmp`).
#[derive(Debug, Clone, Copy)]
pub(crate) struct OrderedPriority(f64);

impl PartialEq for OrderedPriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for OrderedPriority {}

impl PartialOrd for OrderedPriority {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedPriority {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.total_cmp(&other.0)
    }
}

/// Position among eligible tasks: highest priority first, then earliest
/// eligibility time, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ReadyKey {
    priority: Reverse<OrderedPriority>,
    scheduled_at: Instant,
    seq: u64,
}

/// Position among tasks not yet eligible, by eligibility time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct DelayKey {
    scheduled_at: Instant,
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Ready(ReadyKey),
    Delayed(DelayKey),
    Reserved,
    Running,
}

impl Slot {
    fn is_queued(self) -> bool {
        matches!(self, Slot::Ready(_) | Slot::Delayed(_))
    }
}

#[derive(Debug)]
struct Entry {
    handle: TaskHandle,
    slot: Slot,
}

/// Outcome of a removal request.
#[derive(Debug)]
pub(crate) enum Removal {
    NotFound,
    /// The task was only queued and is gone now.
    Removed(TaskHandle),
    /// The task is reserved or running; its worker drops it on hand-back.
    Deferred,
}

/// Outcome of a worker handing a task back.
#[derive(Debug)]
pub(crate) enum Released {
    Requeued,
    Dropped(TaskHandle),
    NotFound,
}

#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    entries: HashMap<TaskId, Entry>,
    ready: BTreeMap<ReadyKey, TaskId>,
    delayed: BTreeMap<DelayKey, TaskId>,
    removal: HashSet<TaskId>,
    in_flight: usize,
    next_seq: u64,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues a task. Returns `false` if it is already tracked.
    pub(crate) fn insert(&mut self, handle: TaskHandle, now: Instant) -> bool {
        let id = handle.id();
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(
            id,
            Entry {
                handle,
                slot: Slot::Reserved,
            },
        );
        self.enqueue(id, now);
        true
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Tracked tasks: queued, reserved and running.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reserved plus running tasks.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether the task is reserved or running.
    pub(crate) fn is_in_flight(&self, id: TaskId) -> bool {
        self.entries
            .get(&id)
            .map_or(false, |entry| !entry.slot.is_queued())
    }

    pub(crate) fn queued(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    /// Reserves the highest-priority task eligible at `now`.
    pub(crate) fn pick(&mut self, now: Instant) -> Option<TaskHandle> {
        self.promote_due(now);

        while let Some((_, id)) = self.ready.pop_first() {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };

            // eligibility moved without a reschedule
            if !entry.handle.is_eligible(now) {
                self.enqueue(id, now);
                continue;
            }

            let handle = entry.handle.clone();
            self.set_slot(id, Slot::Reserved);
            self.in_flight += 1;
            return Some(handle);
        }

        None
    }

    /// Earliest eligibility time among delayed tasks.
    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.delayed.keys().next().map(|key| key.scheduled_at)
    }

    pub(crate) fn mark_running(&mut self, id: TaskId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if entry.slot == Slot::Reserved {
                entry.slot = Slot::Running;
            }
        }
    }

    /// Re-derives the queue position of a queued task from its current
    /// priority and eligibility time. Reserved or running tasks keep their
    /// slot; their new data is read when they are handed back. Returns
    /// whether the task is tracked at all.
    pub(crate) fn reschedule(&mut self, id: TaskId, now: Instant) -> bool {
        let Some(slot) = self.entries.get(&id).map(|entry| entry.slot) else {
            return false;
        };
        if slot.is_queued() {
            self.unlink(slot);
            self.enqueue(id, now);
        }
        true
    }

    pub(crate) fn mark_for_removal(&mut self, id: TaskId) -> Removal {
        let Some(slot) = self.entries.get(&id).map(|entry| entry.slot) else {
            return Removal::NotFound;
        };

        if slot.is_queued() {
            self.unlink(slot);
            match self.entries.remove(&id) {
                Some(entry) => Removal::Removed(entry.handle),
                None => Removal::NotFound,
            }
        } else {
            self.removal.insert(id);
            Removal::Deferred
        }
    }

    #[cfg(test)]
    pub(crate) fn is_marked_for_removal(&self, id: TaskId) -> bool {
        self.removal.contains(&id)
    }

    /// Hands a reserved or running task back. It is dropped if marked for
    /// removal or if `keep` is false, and re-queued otherwise.
    pub(crate) fn release(&mut self, id: TaskId, keep: bool, now: Instant) -> Released {
        match self.entries.get(&id).map(|entry| entry.slot) {
            Some(Slot::Reserved) | Some(Slot::Running) => {}
            _ => return Released::NotFound,
        }
        self.in_flight -= 1;

        if self.removal.remove(&id) || !keep {
            return match self.entries.remove(&id) {
                Some(entry) => Released::Dropped(entry.handle),
                None => Released::NotFound,
            };
        }

        self.enqueue(id, now);
        Released::Requeued
    }

    /// Removes every queued (not reserved or running) task.
    pub(crate) fn drain_queued(&mut self) -> Vec<TaskHandle> {
        let ids: Vec<TaskId> = self
            .ready
            .values()
            .chain(self.delayed.values())
            .copied()
            .collect();
        self.ready.clear();
        self.delayed.clear();

        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .map(|entry| entry.handle)
            .collect()
    }

    /// Counts queued tasks whose eligibility time is at least `grace` in the
    /// past. O(n) over all tracked tasks.
    pub(crate) fn overdue(&self, now: Instant, grace: Duration) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.slot.is_queued())
            .filter(|entry| {
                now.checked_duration_since(entry.handle.scheduled_at())
                    .map_or(false, |late| late >= grace)
            })
            .count()
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some((key, _)) = self.delayed.first_key_value() {
            if key.scheduled_at > now {
                break;
            }
            if let Some((_, id)) = self.delayed.pop_first() {
                self.enqueue(id, now);
            }
        }
    }

    fn enqueue(&mut self, id: TaskId, now: Instant) {
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let scheduled_at = entry.handle.scheduled_at();
        let priority = entry.handle.priority();
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = if scheduled_at <= now {
            let key = ReadyKey {
                priority: Reverse(OrderedPriority(priority)),
                scheduled_at,
                seq,
            };
            self.ready.insert(key, id);
            Slot::Ready(key)
        } else {
            let key = DelayKey { scheduled_at, seq };
            self.delayed.insert(key, id);
            Slot::Delayed(key)
        };
        self.set_slot(id, slot);
    }

    fn unlink(&mut self, slot: Slot) {
        match slot {
            Slot::Ready(key) => {
                self.ready.remove(&key);
            }
            Slot::Delayed(key) => {
                self.delayed.remove(&key);
            }
            Slot::Reserved | Slot::Running => {}
        }
    }

    fn set_slot(&mut self, id: TaskId, slot: Slot) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.slot = slot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CancelToken, Task, TaskContext};

    struct Noop;

    impl Task for Noop {
        fn body(&self, cx: &TaskContext<'_>, _cancel: &CancelToken) {
            cx.set_finished();
        }
    }

    fn task(priority: f64) -> TaskHandle {
        TaskHandle::new(Noop).with_priority(priority)
    }

    #[test]
    fn test_priority_ordering() {
        assert!(OrderedPriority(10.0) > OrderedPriority(5.0));
        assert!(OrderedPriority(-1.0) < OrderedPriority(0.0));
        assert_eq!(OrderedPriority(2.5), OrderedPriority(2.5));
    }

    #[test]
    fn test_picks_highest_priority_first() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        let low = task(1.0);
        let mid = task(5.0);
        let high = task(10.0);

        queue.insert(low.clone(), now);
        queue.insert(high.clone(), now);
        queue.insert(mid.clone(), now);

        let later = Instant::now();
        assert!(queue.pick(later).unwrap().ptr_eq(&high));
        assert!(queue.pick(later).unwrap().ptr_eq(&mid));
        assert!(queue.pick(later).unwrap().ptr_eq(&low));
        assert!(queue.pick(later).is_none());
        assert_eq!(queue.in_flight(), 3);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_equal_priority_tie_break() {
        let mut queue = TaskQueue::new();
        let late = task(3.0);
        let early = task(3.0);
        early.schedule_from_now_secs(0.0);
        std::thread::sleep(Duration::from_millis(2));
        late.schedule_from_now_secs(0.0);

        let now = Instant::now();
        // inserted out of eligibility order
        queue.insert(late.clone(), now);
        queue.insert(early.clone(), now);

        assert!(queue.pick(now).unwrap().ptr_eq(&early));
        assert!(queue.pick(now).unwrap().ptr_eq(&late));
    }

    #[test]
    fn test_same_instant_falls_back_to_insertion_order() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        let first = task(1.0);
        let second = task(1.0);
        first.schedule_at(now);
        second.schedule_at(now);

        queue.insert(first.clone(), now);
        queue.insert(second.clone(), now);

        assert!(queue.pick(now).unwrap().ptr_eq(&first));
        assert!(queue.pick(now).unwrap().ptr_eq(&second));
    }

    #[test]
    fn test_never_picks_ineligible_task() {
        let mut queue = TaskQueue::new();
        let deferred = task(100.0);
        deferred.schedule_from_now_secs(60.0);
        let eligible = task(1.0);

        let now = Instant::now();
        queue.insert(deferred.clone(), now);
        queue.insert(eligible.clone(), now);

        assert!(queue.pick(now).unwrap().ptr_eq(&eligible));
        assert!(queue.pick(now).is_none());
        assert_eq!(queue.next_due(), Some(deferred.scheduled_at()));

        // the delayed task becomes the top pick once its time has come
        let much_later = deferred.scheduled_at() + Duration::from_millis(1);
        assert!(queue.pick(much_later).unwrap().ptr_eq(&deferred));
    }

    #[test]
    fn test_stale_ready_entry_is_not_returned() {
        let mut queue = TaskQueue::new();
        let handle = task(1.0);
        let now = Instant::now();
        queue.insert(handle.clone(), now);

        // moved into the future without telling the queue
        handle.schedule_from_now_secs(60.0);
        assert!(queue.pick(Instant::now()).is_none());
        assert_eq!(queue.queued(), 1);
    }

    #[test]
    fn test_reschedule_reorders_queued_task() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        let a = task(1.0);
        let b = task(2.0);
        queue.insert(a.clone(), now);
        queue.insert(b.clone(), now);

        a.set_priority(3.0);
        assert!(queue.reschedule(a.id(), now));
        assert!(queue.pick(now).unwrap().ptr_eq(&a));
        assert_eq!(queue.queued(), 1);
    }

    #[test]
    fn test_reschedule_of_running_task_waits_for_release() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        let handle = task(1.0);
        queue.insert(handle.clone(), now);

        let picked = queue.pick(now).unwrap();
        queue.mark_running(picked.id());

        handle.schedule_from_now_secs(60.0);
        assert!(queue.reschedule(handle.id(), now));
        // nothing was re-inserted while it runs
        assert_eq!(queue.queued(), 0);

        assert!(matches!(queue.release(handle.id(), true, now), Released::Requeued));
        assert_eq!(queue.queued(), 1);
        assert!(queue.pick(now).is_none());
    }

    #[test]
    fn test_removal_of_queued_and_in_flight() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        let queued = task(1.0);
        let running = task(2.0);
        queue.insert(queued.clone(), now);
        queue.insert(running.clone(), now);

        let picked = queue.pick(now).unwrap();
        assert!(picked.ptr_eq(&running));
        assert!(queue.is_in_flight(running.id()));
        assert!(!queue.is_in_flight(queued.id()));

        assert!(matches!(queue.mark_for_removal(queued.id()), Removal::Removed(_)));
        assert!(matches!(queue.mark_for_removal(running.id()), Removal::Deferred));
        assert!(queue.is_marked_for_removal(running.id()));

        // a deferred removal wins over keep
        assert!(matches!(queue.release(running.id(), true, now), Released::Dropped(_)));
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), 0);
        assert!(matches!(queue.mark_for_removal(running.id()), Removal::NotFound));
    }

    #[test]
    fn test_double_insert_is_rejected() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        let handle = task(1.0);
        assert!(queue.insert(handle.clone(), now));
        assert!(!queue.insert(handle, now));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_and_overdue() {
        let mut queue = TaskQueue::new();
        let now = Instant::now();
        let past = task(1.0);
        let future = task(1.0);
        future.schedule_from_now_secs(60.0);
        queue.insert(past.clone(), now);
        queue.insert(future.clone(), now);

        let later = now + Duration::from_secs(2);
        assert_eq!(queue.overdue(later, Duration::from_secs(1)), 1);
        assert_eq!(queue.overdue(later, Duration::from_secs(10)), 0);

        let drained = queue.drain_queued();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.queued(), 0);
    }
}
