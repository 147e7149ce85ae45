//! Bounded FIFO storage backing the entity feeds.

use std::collections::VecDeque;

/// Bounded FIFO used for the recent-events feed, the stale side history and
/// the event-id memory. A push into a full buffer hands back the entry it
/// displaced so callers can forget derived state (e.g. an id index).
#[derive(Debug, Clone)]
pub(crate) struct RingBuffer<T> {
    items: VecDeque<T>,
    cap: usize,
}

impl<T> RingBuffer<T> {
    /// # Panics
    ///
    /// On a zero `cap`. [`SyncConfig::validate`](crate::SyncConfig::validate)
    /// rejects zero capacities before any buffer is built.
    pub(crate) fn new(cap: usize) -> Self {
        assert!(cap > 0, "RingBuffer capacity must be > 0");
        Self {
            items: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    /// Appends `value`; returns the displaced oldest entry, if any.
    pub(crate) fn push(&mut self, value: T) -> Option<T> {
        let displaced = (self.items.len() == self.cap)
            .then(|| self.items.pop_front())
            .flatten();
        self.items.push_back(value);
        displaced
    }

    /// Oldest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}
