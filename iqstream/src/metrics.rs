//! Process-wide counters for the streaming pipeline.
//!
//! Created when a pipeline starts, shared by `Arc` between the poll thread and
//! the transport pump, read by whoever observes the pipeline, and never reset
//! while it runs. Every non-fatal condition in the pipeline lands here; log
//! lines are supplementary.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::transport::TransferStatus;

/// Live counters. All updates are relaxed; readers get a consistent-enough
/// view through [`PipelineMetrics::snapshot`].
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub(crate) passes: AtomicU64,
    pub(crate) idle_passes: AtomicU64,
    pub(crate) slots_consumed: AtomicU64,
    pub(crate) batches_completed: AtomicU64,
    pub(crate) overruns: AtomicU64,
    pub(crate) overrun_skipped_slots: AtomicU64,
    pub(crate) head_out_of_range: AtomicU64,
    pub(crate) busy_nanos: AtomicU64,
    pub(crate) invalid_channel_slots: AtomicU64,
    pub(crate) sequence_gaps: AtomicU64,
    pub(crate) lost_slots: AtomicU64,
    pub(crate) starved_slots: AtomicU64,
    pub(crate) submissions: AtomicU64,
    pub(crate) submit_errors: AtomicU64,
    pub(crate) completed_ok: AtomicU64,
    pub(crate) completed_aborted: AtomicU64,
    pub(crate) completed_overflow: AtomicU64,
    pub(crate) completed_short: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_completion(&self, status: TransferStatus) {
        bump(match status {
            TransferStatus::Ok => &self.completed_ok,
            TransferStatus::Aborted => &self.completed_aborted,
            TransferStatus::Overflow => &self.completed_overflow,
            TransferStatus::Short => &self.completed_short,
        });
    }

    /// Copies every counter.
    ///
    /// `transport_overflows` lives in the handoff queue and is left at zero;
    /// [`crate::pipeline::Pipeline::snapshot`] fills it in.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            passes: get(&self.passes),
            idle_passes: get(&self.idle_passes),
            slots_consumed: get(&self.slots_consumed),
            batches_completed: get(&self.batches_completed),
            overruns: get(&self.overruns),
            overrun_skipped_slots: get(&self.overrun_skipped_slots),
            head_out_of_range: get(&self.head_out_of_range),
            busy_nanos: get(&self.busy_nanos),
            invalid_channel_slots: get(&self.invalid_channel_slots),
            sequence_gaps: get(&self.sequence_gaps),
            lost_slots: get(&self.lost_slots),
            starved_slots: get(&self.starved_slots),
            transport_overflows: 0,
            submissions: get(&self.submissions),
            submit_errors: get(&self.submit_errors),
            completed_ok: get(&self.completed_ok),
            completed_aborted: get(&self.completed_aborted),
            completed_overflow: get(&self.completed_overflow),
            completed_short: get(&self.completed_short),
        }
    }
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Poll passes run.
    pub passes: u64,
    /// Passes that returned early below the low watermark.
    pub idle_passes: u64,
    /// Ring slots consumed (including skipped and starved ones).
    pub slots_consumed: u64,
    /// Batches handed to the transport queue.
    pub batches_completed: u64,
    /// Backlog overruns recovered by jumping to `head`.
    pub overruns: u64,
    /// Slots discarded by those jumps.
    pub overrun_skipped_slots: u64,
    /// Passes that saw a `head` outside the ring.
    pub head_out_of_range: u64,
    /// Time spent in passes that consumed slots.
    pub busy_nanos: u64,
    /// Slots skipped for an out-of-range channel id.
    pub invalid_channel_slots: u64,
    /// Sequence discontinuities across all channels.
    pub sequence_gaps: u64,
    /// Slots the discontinuities imply were never seen.
    pub lost_slots: u64,
    /// Slots dropped because no batch buffer was free.
    pub starved_slots: u64,
    /// Pending batches overwritten before the transport took them.
    pub transport_overflows: u64,
    /// Batches submitted to the endpoint.
    pub submissions: u64,
    /// Submissions the endpoint refused.
    pub submit_errors: u64,
    pub completed_ok: u64,
    pub completed_aborted: u64,
    pub completed_overflow: u64,
    pub completed_short: u64,
}

impl MetricsSnapshot {
    /// Batches completed by the endpoint, whatever the status.
    pub const fn completions(&self) -> u64 {
        self.completed_ok + self.completed_aborted + self.completed_overflow + self.completed_short
    }
}
