//! Timer scheduler owned by a node.
//!
//! Named timers are registered once together with the task they run and
//! are then armed, re-armed or cancelled through their [`TimerHandle`].
//! One-shot work goes through [`Scheduler::defer`]. Due tasks come out of
//! [`Scheduler::pop_due`] in deadline order, ties in scheduling order.
//!
//! All pending work lives inside the scheduler, so dropping the node drops
//! every timer with it.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::time::{Duration, Timestamp};

/// Handle of a named timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(usize);

type Key = (Timestamp, u64);

struct Slot<T> {
    task: T,
    armed: Option<Key>,
}

/// Deadline-ordered task queue with named, re-armable timers.
pub struct Scheduler<T> {
    pending: BTreeMap<Key, (Option<TimerHandle>, T)>,
    slots: Vec<Slot<T>>,
    next_seq: u64,
}

impl<T: Clone> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            slots: Vec::new(),
            next_seq: 0,
        }
    }

    /// Create a named timer that runs `task`. The timer starts idle.
    pub fn register(&mut self, task: T) -> TimerHandle {
        self.slots.push(Slot { task, armed: None });
        TimerHandle(self.slots.len() - 1)
    }

    fn insert(&mut self, at: Timestamp, handle: Option<TimerHandle>, task: T) -> Key {
        let key = (at, self.next_seq);
        self.next_seq += 1;
        self.pending.insert(key, (handle, task));
        key
    }

    /// Cancel, then arm the timer to run its task after `delay`.
    pub fn schedule_after(&mut self, handle: TimerHandle, now: Timestamp, delay: Duration) {
        self.cancel(handle);
        let task = self.slots[handle.0].task.clone();
        let key = self.insert(now.saturating_add(delay), Some(handle), task);
        self.slots[handle.0].armed = Some(key);
    }

    /// Replace the task of a named timer and arm it after `delay`.
    pub fn schedule_with(&mut self, handle: TimerHandle, task: T, now: Timestamp, delay: Duration) {
        self.slots[handle.0].task = task;
        self.schedule_after(handle, now, delay);
    }

    /// Arm the timer with `delay` only if that brings it forward.
    ///
    /// Applied when `delay` is positive and the timer is idle or has more
    /// than `delay` left. Returns whether the timer was re-armed.
    pub fn reschedule_if_sooner(&mut self, handle: TimerHandle, now: Timestamp, delay: Duration) -> bool {
        if delay.is_zero() {
            return false;
        }
        let left = self.remaining(handle, now);
        if left.is_zero() || left > delay {
            self.schedule_after(handle, now, delay);
            true
        } else {
            false
        }
    }

    /// Disarm a named timer. Idempotent.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(key) = self.slots[handle.0].armed.take() {
            self.pending.remove(&key);
        }
    }

    pub fn is_armed(&self, handle: TimerHandle) -> bool {
        self.slots[handle.0].armed.is_some()
    }

    /// Time left until the timer fires, zero when idle.
    pub fn remaining(&self, handle: TimerHandle, now: Timestamp) -> Duration {
        match self.slots[handle.0].armed {
            Some((at, _)) => at.saturating_sub(now),
            None => Duration::ZERO,
        }
    }

    /// Run `task` once at `at`.
    pub fn defer(&mut self, at: Timestamp, task: T) {
        self.insert(at, None, task);
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.pending.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the earliest task due at or before `now`.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<T> {
        let (&key, _) = self.pending.iter().next()?;
        if key.0 > now {
            return None;
        }
        let (handle, task) = self.pending.remove(&key)?;
        if let Some(h) = handle {
            self.slots[h.0].armed = None;
        }
        Some(task)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
