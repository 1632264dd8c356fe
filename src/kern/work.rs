//! System Ticks and Delayed Work
//!
//! A coarse tick counter advanced by the host timer interrupt, plus a
//! queue of delayed background work items keyed by kind. Scheduling a
//! kind that is already pending replaces its deadline, so at most one
//! instance of each kind is ever outstanding. Expediting moves the
//! pending instance up to the next tick.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Ticks per second (one tick per host timer interrupt)
pub const TICKS_PER_SECOND: u64 = 1000;

/// Kinds of background work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkKind {
    /// Top the stack page cache back up to its target
    CacheMaintain,
}

/// Queue of pending delayed work, one slot per kind
#[derive(Debug)]
pub struct DelayedWorkQueue {
    pending: BTreeMap<WorkKind, u64>,
}

impl DelayedWorkQueue {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
        }
    }

    /// Schedule work after `delay` ticks, replacing any pending instance
    pub fn schedule(&mut self, kind: WorkKind, now: u64, delay: u64) {
        self.pending.insert(kind, now + delay);
    }

    /// Move pending (or fresh) work up to run on the next tick
    pub fn expedite(&mut self, kind: WorkKind, now: u64) {
        self.pending.insert(kind, now);
    }

    /// Remove and return every kind whose deadline has passed
    pub fn take_due(&mut self, now: u64) -> Vec<WorkKind> {
        let due: Vec<WorkKind> = self
            .pending
            .iter()
            .filter(|&(_, &deadline)| deadline <= now)
            .map(|(&kind, _)| kind)
            .collect();
        for kind in &due {
            self.pending.remove(kind);
        }
        due
    }

    /// Deadline of a pending kind
    pub fn deadline(&self, kind: WorkKind) -> Option<u64> {
        self.pending.get(&kind).copied()
    }

    /// Is an instance of this kind outstanding?
    pub fn is_pending(&self, kind: WorkKind) -> bool {
        self.pending.contains_key(&kind)
    }
}

// ============================================================================
// Global State
// ============================================================================

/// System tick counter
static SYSTEM_TICKS: AtomicU64 = AtomicU64::new(0);

static WORK_QUEUE: spin::Once<Mutex<DelayedWorkQueue>> = spin::Once::new();

fn work_queue() -> &'static Mutex<DelayedWorkQueue> {
    WORK_QUEUE.call_once(|| Mutex::new(DelayedWorkQueue::new()));
    WORK_QUEUE.get().unwrap()
}

/// Initialize the work subsystem
pub fn init() {
    let _ = work_queue();
}

/// Current system ticks
pub fn ticks() -> u64 {
    SYSTEM_TICKS.load(Ordering::SeqCst)
}

/// Host timer interrupt: advance the clock and run due work
pub fn timer_tick() {
    let now = SYSTEM_TICKS.fetch_add(1, Ordering::SeqCst) + 1;
    run_due(now);
}

/// Run everything due at `now`; work functions run outside the queue lock
pub fn run_due(now: u64) {
    let due = work_queue().lock().take_due(now);
    for kind in due {
        dispatch(kind);
    }
}

fn dispatch(kind: WorkKind) {
    match kind {
        WorkKind::CacheMaintain => crate::vm::stack::cache_maintain_work(),
    }
}

/// Schedule work after `delay` ticks
pub fn schedule(kind: WorkKind, delay: u64) {
    let now = ticks();
    work_queue().lock().schedule(kind, now, delay);
}

/// Expedite pending work to the next tick
pub fn expedite(kind: WorkKind) {
    let now = ticks();
    work_queue().lock().expedite(kind, now);
}

/// Is an instance of this kind outstanding?
pub fn pending(kind: WorkKind) -> bool {
    work_queue().lock().is_pending(kind)
}

/// Convert milliseconds to ticks
pub const fn ms_to_ticks(ms: u64) -> u64 {
    (ms * TICKS_PER_SECOND) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_and_take_due() {
        let mut queue = DelayedWorkQueue::new();
        queue.schedule(WorkKind::CacheMaintain, 0, 100);

        assert!(queue.is_pending(WorkKind::CacheMaintain));
        assert!(queue.take_due(50).is_empty());
        assert_eq!(queue.take_due(100), [WorkKind::CacheMaintain]);
        assert!(!queue.is_pending(WorkKind::CacheMaintain));
    }

    #[test]
    fn test_schedule_replaces_pending() {
        let mut queue = DelayedWorkQueue::new();
        queue.schedule(WorkKind::CacheMaintain, 0, 100);
        queue.schedule(WorkKind::CacheMaintain, 0, 500);

        assert_eq!(queue.deadline(WorkKind::CacheMaintain), Some(500));
        assert!(queue.take_due(100).is_empty());
        assert_eq!(queue.take_due(500).len(), 1);
    }

    #[test]
    fn test_expedite() {
        let mut queue = DelayedWorkQueue::new();
        queue.schedule(WorkKind::CacheMaintain, 0, 1000);
        queue.expedite(WorkKind::CacheMaintain, 3);

        assert_eq!(queue.deadline(WorkKind::CacheMaintain), Some(3));
        assert_eq!(queue.take_due(3).len(), 1);
    }

    #[test]
    fn test_ms_conversion() {
        assert_eq!(ms_to_ticks(250), 250);
        assert_eq!(ms_to_ticks(1000), TICKS_PER_SECOND);
    }
}
