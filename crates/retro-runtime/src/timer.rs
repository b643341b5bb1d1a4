//! Cancelable timers on an explicit clock

use std::collections::{BTreeMap, HashMap};

use retro_core::Timestamp;

/// Handle returned by [`TimerQueue::schedule`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Deadline-ordered timers. Timers with the same deadline fire in
/// scheduling order.
#[derive(Debug)]
pub struct TimerQueue<K> {
    next: u64,
    by_deadline: BTreeMap<(Timestamp, u64), K>,
    deadlines: HashMap<u64, Timestamp>,
}

impl<K> Default for TimerQueue<K> {
    fn default() -> Self {
        TimerQueue {
            next: 0,
            by_deadline: BTreeMap::new(),
            deadlines: HashMap::new(),
        }
    }
}

impl<K> TimerQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Timestamp, key: K) -> TimerHandle {
        self.next += 1;
        let id = self.next;
        self.by_deadline.insert((at, id), key);
        self.deadlines.insert(id, at);
        TimerHandle(id)
    }

    /// Cancel a pending timer, returning its key if it had not fired
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<K> {
        let at = self.deadlines.remove(&handle.0)?;
        self.by_deadline.remove(&(at, handle.0))
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.deadlines.contains_key(&handle.0)
    }

    /// Remove and return the earliest timer due at or before `now`
    pub fn pop_due(&mut self, now: Timestamp) -> Option<(TimerHandle, K)> {
        let (&(at, id), _) = self.by_deadline.iter().next()?;
        if at > now {
            return None;
        }
        let key = self.by_deadline.remove(&(at, id))?;
        self.deadlines.remove(&id);
        Some((TimerHandle(id), key))
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.by_deadline.keys().next().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.by_deadline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_deadline.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_deadline.clear();
        self.deadlines.clear();
    }
}
