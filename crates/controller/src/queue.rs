use std::collections::VecDeque;

use rustc_hash::FxHashSet;
use strata_core::ObjectKey;

/// Coalescing work queue keyed by object key, FIFO across keys.
///
/// A key is in at most one of three states: queued, in flight, or idle.
/// Pushing a queued key is a no-op; pushing an in-flight key marks it dirty so
/// exactly one follow-up run is queued when the current one finishes.
#[derive(Debug, Default)]
pub struct WorkQueue {
    order: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    in_flight: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    coalesced: u64,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys waiting for a worker.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Notifications absorbed into an already pending run.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    pub fn push(&mut self, key: ObjectKey) {
        if self.in_flight.contains(&key) {
            if !self.dirty.insert(key) {
                self.coalesced += 1;
            }
            return;
        }
        if self.queued.contains(&key) {
            self.coalesced += 1;
            return;
        }
        self.queued.insert(key.clone());
        self.order.push_back(key);
    }

    /// Next key to run; it stays in flight until [`WorkQueue::done`].
    pub fn pop(&mut self) -> Option<ObjectKey> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    /// Mark the run finished; a dirty key goes straight back to the queue.
    pub fn done(&mut self, key: &ObjectKey) {
        self.in_flight.remove(key);
        if self.dirty.remove(key) {
            self.push(key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("g", "v1", "Widget", "t1", name)
    }

    #[test]
    fn queued_keys_coalesce() {
        let mut q = WorkQueue::new();
        q.push(key("a"));
        q.push(key("b"));
        q.push(key("a"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.coalesced(), 1);
        assert_eq!(q.pop(), Some(key("a")));
        assert_eq!(q.pop(), Some(key("b")));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn busy_key_gets_one_follow_up() {
        let mut q = WorkQueue::new();
        q.push(key("a"));
        let a = q.pop().unwrap();
        for _ in 0..10 {
            q.push(key("a"));
        }
        assert!(q.is_empty(), "in-flight key must not be queued twice");
        q.done(&a);
        assert_eq!(q.pop(), Some(key("a")));
        q.done(&key("a"));
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }
}
