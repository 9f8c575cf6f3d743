//! Per-channel sequence-counter tracking.

/// Result of feeding one sequence counter to a [`SequenceTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InOrder,
    /// The counter did not follow the previous one. `missing` is the number
    /// of slots skipped by a forward jump; a backward jump reports zero.
    Gap {
        expected: u32,
        observed: u32,
        missing: u32,
    },
}

/// Expects each channel's counter to start at zero and advance by one per
/// slot. Any discontinuity is reported and the tracker resynchronizes to the
/// observed value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceTracker {
    expected: u32,
    last_seen: Option<u32>,
    dropped: u32,
}

impl SequenceTracker {
    pub const fn new() -> Self {
        Self {
            expected: 0,
            last_seen: None,
            dropped: 0,
        }
    }

    pub fn observe(&mut self, observed: u32) -> SequenceCheck {
        let expected = self.expected;
        self.last_seen = Some(observed);
        self.expected = observed.wrapping_add(1);
        if observed == expected {
            return SequenceCheck::InOrder;
        }
        // Distances past half the counter space are treated as the producer
        // restarting behind us.
        let delta = observed.wrapping_sub(expected);
        let missing = if (delta as i32) > 0 { delta } else { 0 };
        self.dropped = self.dropped.wrapping_add(missing);
        SequenceCheck::Gap {
            expected,
            observed,
            missing,
        }
    }

    pub const fn last_seen(&self) -> Option<u32> {
        self.last_seen
    }

    /// Slots skipped by forward gaps so far.
    pub const fn dropped(&self) -> u32 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_gap_in_zero_one_two_five_six() {
        let mut tracker = SequenceTracker::new();
        let checks: Vec<_> = [0, 1, 2, 5, 6].map(|s| tracker.observe(s)).into();
        let gaps: Vec<_> = checks
            .iter()
            .filter(|c| matches!(c, SequenceCheck::Gap { .. }))
            .collect();
        assert_eq!(
            gaps,
            [&SequenceCheck::Gap {
                expected: 3,
                observed: 5,
                missing: 2
            }]
        );
        assert_eq!(tracker.last_seen(), Some(6));
        assert_eq!(tracker.dropped(), 2);
    }

    #[test]
    fn resynchronizes_after_gap() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(0);
        tracker.observe(5);
        assert_eq!(tracker.last_seen(), Some(5));
        assert_eq!(tracker.observe(6), SequenceCheck::InOrder);
    }

    #[test]
    fn first_sample_off_zero_is_a_gap() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(
            tracker.observe(10),
            SequenceCheck::Gap {
                expected: 0,
                observed: 10,
                missing: 10
            }
        );
    }

    #[test]
    fn backward_jump_counts_no_loss() {
        let mut tracker = SequenceTracker::new();
        for s in 0..4 {
            tracker.observe(s);
        }
        assert_eq!(
            tracker.observe(1),
            SequenceCheck::Gap {
                expected: 4,
                observed: 1,
                missing: 0
            }
        );
        assert_eq!(tracker.dropped(), 0);
    }

    #[test]
    fn counter_wraps_without_gap() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(u32::MAX - 1);
        assert_eq!(tracker.observe(u32::MAX), SequenceCheck::InOrder);
        assert_eq!(tracker.observe(0), SequenceCheck::InOrder);
    }
}
