//! Deadline-bucket timer wheel backing reactor timers.
//!
//! Entries are keyed by absolute deadline on a 1ms tick lattice. The wheel
//! never reads the clock itself: the reactor advances it with the *measured*
//! elapsed time around each blocking wait, because `poll(2)` can return both
//! early (readiness, signal) and late (scheduler jitter).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;

/// Timer wheel over copyable entry keys.
///
/// Expired entries are collected into a ready list by [`step`] and drained
/// with [`pop_ready`], in deadline order (insertion order within one
/// deadline).
///
/// [`step`]: TimerWheel::step
/// [`pop_ready`]: TimerWheel::pop_ready
#[derive(Debug, Default)]
pub struct TimerWheel<K: Copy + Eq + Hash> {
    /// Absolute deadline tick → entries, insertion-ordered.
    buckets: BTreeMap<u64, Vec<K>>,
    /// Reverse index for cancellation.
    deadlines: HashMap<K, u64>,
    /// Current tick (1 tick = 1ms), advanced only by `step`.
    now: u64,
    /// Expired entries awaiting dispatch.
    ready: VecDeque<K>,
}

impl<K: Copy + Eq + Hash> TimerWheel<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: BTreeMap::new(),
            deadlines: HashMap::new(),
            now: 0,
            ready: VecDeque::new(),
        }
    }

    /// Schedules `key` to expire `delay_ms` from the current tick.
    ///
    /// Re-adding a scheduled key moves it to the new deadline.
    pub fn add(&mut self, key: K, delay_ms: u64) {
        self.remove(key);
        let deadline = self.now + delay_ms;
        self.buckets.entry(deadline).or_default().push(key);
        self.deadlines.insert(key, deadline);
    }

    /// Cancels a scheduled key. Returns `false` if it was not present.
    pub fn remove(&mut self, key: K) -> bool {
        let Some(deadline) = self.deadlines.remove(&key) else {
            // May still be sitting in the ready list.
            let before = self.ready.len();
            self.ready.retain(|k| *k != key);
            return self.ready.len() != before;
        };
        if let Some(bucket) = self.buckets.get_mut(&deadline) {
            bucket.retain(|k| *k != key);
            if bucket.is_empty() {
                self.buckets.remove(&deadline);
            }
        }
        true
    }

    /// Milliseconds until the earliest expiry, or `None` to block forever.
    ///
    /// Returns `Some(0)` while expired entries are waiting in the ready list.
    #[must_use]
    pub fn timeout(&self) -> Option<u64> {
        if !self.ready.is_empty() {
            return Some(0);
        }
        self.buckets
            .keys()
            .next()
            .map(|deadline| deadline.saturating_sub(self.now))
    }

    /// Advances the wheel clock by `elapsed_ms` and collects expired entries.
    pub fn step(&mut self, elapsed_ms: u64) {
        self.now += elapsed_ms;
        while let Some((&deadline, _)) = self.buckets.iter().next() {
            if deadline > self.now {
                break;
            }
            let bucket = self.buckets.remove(&deadline).unwrap_or_default();
            for key in bucket {
                self.deadlines.remove(&key);
                self.ready.push_back(key);
            }
        }
    }

    /// Pops the next expired entry, in expiry order.
    pub fn pop_ready(&mut self) -> Option<K> {
        self.ready.pop_front()
    }

    /// True when nothing is scheduled and nothing is ready.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.ready.is_empty()
    }
}
