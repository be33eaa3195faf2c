use std::collections::VecDeque;

/// Bounded holder that evicts the oldest entry on overflow so the newest
/// value always wins. Pushing never blocks.
#[derive(Debug)]
pub struct LatestBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> LatestBuffer<T> {
    /// Create a buffer holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Drain the buffer and return only the newest entry.
    pub fn take_latest(&mut self) -> Option<T> {
        let latest = self.items.pop_back();
        self.items.clear();
        latest
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
