//! # Bounded Offline Queue
//!
//! FIFO buffer for work that cannot be delivered right now. One
//! implementation serves both the transport-level queue (message envelopes)
//! and the sync-level queue (data changes).
//!
//! ## Overflow Handling
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                   Bounded Queue (capacity 3)                            │
//! │                                                                         │
//! │  DropOldest (default)          RejectNewest                             │
//! │  ────────────────────          ────────────                             │
//! │  [A, B, C] + D                 [A, B, C] + D                            │
//! │      │                             │                                    │
//! │      ▼                             ▼                                    │
//! │  [B, C, D]  → Evicted(A)       [A, B, C]  → Rejected(D)                 │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `drain()` swaps the whole buffer out in one step: anything pushed while
//! the drained batch is being processed lands in the fresh buffer and is
//! picked up by the next pass.

use std::collections::VecDeque;

/// What to do when pushing into a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Evict the head to make room for the new item.
    #[default]
    DropOldest,
    /// Keep the queue as is and hand the new item back.
    RejectNewest,
}

/// Result of a push.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// Stored without displacing anything.
    Accepted,
    /// Stored; this item was evicted to make room.
    Evicted(T),
    /// Not stored; the item is handed back.
    Rejected(T),
}

/// Capacity-bounded FIFO queue.
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
    policy: EvictionPolicy,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue that evicts the oldest entry on overflow.
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, EvictionPolicy::DropOldest)
    }

    /// Creates a queue with an explicit eviction policy.
    pub fn with_policy(capacity: usize, policy: EvictionPolicy) -> Self {
        let capacity = capacity.max(1);
        BoundedQueue {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            policy,
        }
    }

    /// Appends at the tail, applying the eviction policy when full.
    pub fn push(&mut self, item: T) -> PushOutcome<T> {
        if self.items.len() < self.capacity {
            self.items.push_back(item);
            return PushOutcome::Accepted;
        }

        match self.policy {
            EvictionPolicy::RejectNewest => PushOutcome::Rejected(item),
            EvictionPolicy::DropOldest => {
                let evicted = self.items.pop_front();
                self.items.push_back(item);
                match evicted {
                    Some(old) => PushOutcome::Evicted(old),
                    None => PushOutcome::Accepted,
                }
            }
        }
    }

    /// Puts items back at the head, preserving their relative order.
    ///
    /// Used when a replay pass fails part-way. Returns whatever no longer
    /// fits; under `DropOldest` that is the oldest of the combined content.
    pub fn requeue_front(&mut self, items: Vec<T>) -> Vec<T> {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }

        let mut overflow = Vec::new();
        while self.items.len() > self.capacity {
            let dropped = match self.policy {
                EvictionPolicy::DropOldest => self.items.pop_front(),
                EvictionPolicy::RejectNewest => self.items.pop_back(),
            };
            match dropped {
                Some(item) => overflow.push(item),
                None => break,
            }
        }
        overflow
    }

    /// Removes and returns every item, head first.
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items).into()
    }

    /// Removes up to `n` items from the head, in order.
    pub fn take_front(&mut self, n: usize) -> Vec<T> {
        let n = n.min(self.items.len());
        self.items.drain(..n).collect()
    }

    /// Removes every item matching `pred`, returning them in queue order.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for item in self.items.drain(..) {
            if pred(&item) {
                removed.push(item);
            } else {
                kept.push_back(item);
            }
        }
        self.items = kept;
        removed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates head to tail without removing.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}
