//! Timer set ordered by due time
//!
//! Timers live in a `BTreeMap` keyed by `(due_ms, seq)`, so timers due at the
//! same instant fire in arming order. Each timer carries a shared cancelled
//! flag that is re-checked when its macrotask finally runs.

use crate::error::Result;
use crate::runtime::Value;
use rustc_hash::FxHashMap as HashMap;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use super::{SinkId, TaskScheduler};

/// Opaque timer identifier; ids are never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host callback for timers armed from Rust
pub type HostTimerFn = Rc<dyn Fn(&TaskScheduler) -> Result<()>>;

/// What a timer runs when it fires
#[derive(Clone)]
pub enum TimerCallback {
    /// Script callable with bound arguments
    Script { callable: Value, args: Vec<Value> },
    /// Host function
    Host(HostTimerFn),
}

struct TimerEntry {
    key: Option<(u64, u64)>,
    interval: Option<u64>,
    callback: TimerCallback,
    cancelled: Rc<Cell<bool>>,
    origin: Option<SinkId>,
}

/// A timer that came due, ready to become a macrotask
pub(crate) struct FiredTimer {
    pub id: TimerId,
    pub callback: TimerCallback,
    pub cancelled: Rc<Cell<bool>>,
    pub repeating: bool,
    pub origin: Option<SinkId>,
}

#[derive(Default)]
pub(crate) struct TimerSet {
    queue: BTreeMap<(u64, u64), TimerId>,
    entries: HashMap<TimerId, TimerEntry>,
    next_id: u64,
    next_seq: u64,
}

impl TimerSet {
    pub(crate) fn arm(
        &mut self,
        due: u64,
        callback: TimerCallback,
        interval: Option<u64>,
        origin: Option<SinkId>,
    ) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let key = self.enqueue(due, id);
        self.entries.insert(
            id,
            TimerEntry {
                key: Some(key),
                interval,
                callback,
                cancelled: Rc::new(Cell::new(false)),
                origin,
            },
        );
        id
    }

    fn enqueue(&mut self, due: u64, id: TimerId) -> (u64, u64) {
        self.next_seq += 1;
        let key = (due, self.next_seq);
        self.queue.insert(key, id);
        key
    }

    /// Cancel a timer. Unknown or already-cancelled ids are ignored.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                entry.cancelled.set(true);
                if let Some(key) = entry.key {
                    self.queue.remove(&key);
                }
                true
            }
            None => false,
        }
    }

    /// Pop every timer due at or before `now`, in due order. Repeating
    /// timers are re-armed at `now + interval`; one-shot entries stay
    /// registered (unqueued) until [`TimerSet::finish`] so they can still be
    /// cancelled while their macrotask waits.
    pub(crate) fn take_due(&mut self, now: u64) -> Vec<FiredTimer> {
        let mut fired = Vec::new();
        while let Some((&key, &id)) = self.queue.iter().next() {
            if key.0 > now {
                break;
            }
            self.queue.remove(&key);
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            entry.key = None;
            fired.push(FiredTimer {
                id,
                callback: entry.callback.clone(),
                cancelled: entry.cancelled.clone(),
                repeating: entry.interval.is_some(),
                origin: entry.origin,
            });
            if let Some(interval) = entry.interval {
                let key = self.enqueue(now.saturating_add(interval), id);
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.key = Some(key);
                }
            }
        }
        fired
    }

    /// Forget a one-shot timer once its macrotask ran
    pub(crate) fn finish(&mut self, id: TimerId) {
        if self.entries.get(&id).is_some_and(|entry| entry.key.is_none()) {
            self.entries.remove(&id);
        }
    }

    pub(crate) fn next_due(&self) -> Option<u64> {
        self.queue.keys().next().map(|key| key.0)
    }

    /// Number of timers still queued for a future firing
    pub(crate) fn armed(&self) -> usize {
        self.queue.len()
    }
}
