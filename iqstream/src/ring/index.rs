//! Index arithmetic over a ring of `capacity` slots.
//!
//! Both `head` and `tail` are slot indices in `[0, capacity)`. The producer
//! wraps `head` itself, so there is no free-running counter to subtract; the
//! readable distance is recovered modulo the capacity.

use std::ops::Range;

/// Number of slots between `tail` (inclusive) and `head` (exclusive).
///
/// Always `< capacity`: a full lap is indistinguishable from an empty ring,
/// which is one reason the consumer stays far behind the producer.
#[inline]
#[must_use]
pub const fn readable(head: usize, tail: usize, capacity: usize) -> usize {
    debug_assert!(head < capacity && tail < capacity);
    (head + capacity - tail) % capacity
}

/// Moves `index` forward by `by` slots, wrapping at `capacity`.
#[inline]
#[must_use]
pub const fn advance(index: usize, by: usize, capacity: usize) -> usize {
    (index + by) % capacity
}

/// Splits `count` slots starting at `tail` into at most two contiguous ranges.
///
/// The second range is present only when the run wraps past the end of the
/// ring, in which case it always starts at slot 0.
#[must_use]
pub fn segments(tail: usize, count: usize, capacity: usize) -> (Range<usize>, Option<Range<usize>>) {
    debug_assert!(tail < capacity && count <= capacity);
    let end = tail + count;
    if end <= capacity {
        (tail..end, None)
    } else {
        (tail..capacity, Some(0..end - capacity))
    }
}
