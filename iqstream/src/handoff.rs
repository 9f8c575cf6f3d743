//! Bounded handoff between the batcher and the transport.
//!
//! The batcher pushes completed batches; the transport drains them with
//! [`HandoffQueue::pop_range`] and hands finished buffers back through
//! [`HandoffQueue::retire`]. The lock covers only the index bookkeeping: items
//! are moved in and out by value, so no payload is touched while it is held.
//!
//! When the transport falls behind the queue never blocks the producer. A push
//! into a full queue evicts the oldest pending item, moves it to the retired
//! list so its memory is reused, and counts an overflow.
//!
//! Retired items come back in the order they were retired, so a fixed pool
//! cycles through every buffer instead of reusing the most recent one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

struct Slots<T> {
    pending: VecDeque<T>,
    retired: VecDeque<T>,
}

pub struct HandoffQueue<T> {
    capacity: usize,
    slots: Mutex<Slots<T>>,
    overflows: AtomicU64,
}

impl<T> HandoffQueue<T> {
    /// Creates a queue holding at most `capacity` pending items.
    ///
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "handoff queue needs at least one slot");
        Self {
            capacity,
            slots: Mutex::new(Slots {
                pending: VecDeque::with_capacity(capacity),
                retired: VecDeque::new(),
            }),
            overflows: AtomicU64::new(0),
        }
    }

    // A panic while holding the lock leaves the indices consistent (every
    // mutation is a single push or pop), so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends `item`. Returns `true` if the oldest pending item had to be
    /// overwritten to make room.
    pub fn push(&self, item: T) -> bool {
        let mut slots = self.lock();
        let overwrote = if slots.pending.len() == self.capacity {
            if let Some(oldest) = slots.pending.pop_front() {
                slots.retired.push_back(oldest);
            }
            self.overflows.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        };
        slots.pending.push_back(item);
        overwrote
    }

    /// Moves every pending item into `out`, oldest first. Returns how many
    /// were moved.
    pub fn pop_range(&self, out: &mut Vec<T>) -> usize {
        let mut slots = self.lock();
        let n = slots.pending.len();
        out.extend(slots.pending.drain(..));
        n
    }

    /// Returns an item the transport has finished with.
    pub fn retire(&self, item: T) {
        self.lock().retired.push_back(item);
    }

    /// Seeds the retired list, typically with freshly allocated buffers.
    pub fn stock(&self, items: impl IntoIterator<Item = T>) {
        self.lock().retired.extend(items);
    }

    /// Takes an item back for reuse.
    ///
    /// Prefers the longest-retired item. Failing that, the oldest pending item is taken
    /// back before the transport ever saw it, which counts as an overflow.
    /// Returns `None` only when every item is with the transport.
    pub fn reclaim(&self) -> Option<T> {
        let mut slots = self.lock();
        if let Some(item) = slots.retired.pop_front() {
            return Some(item);
        }
        let stolen = slots.pending.pop_front()?;
        self.overflows.fetch_add(1, Ordering::Relaxed);
        Some(stolen)
    }

    /// Items waiting for the transport.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Items ready for reuse.
    pub fn retired(&self) -> usize {
        self.lock().retired.len()
    }

    /// Pending items lost to overwrite or reclaim since creation.
    #[inline]
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for HandoffQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.lock();
        f.debug_struct("HandoffQueue")
            .field("capacity", &self.capacity)
            .field("pending", &slots.pending.len())
            .field("retired", &slots.retired.len())
            .field("overflows", &self.overflows())
            .finish()
    }
}
