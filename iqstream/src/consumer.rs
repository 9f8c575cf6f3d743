//! One pass of the ring consumer.
//!
//! A pass reads the producer's `head`, decides how much of the ring it may
//! consume, makes those slots visible, demultiplexes them by channel into the
//! [`StagingBatcher`] and writes the new tail back. It never blocks; the
//! caller decides when to run the next pass.

use std::ops::Deref;
use std::sync::Arc;

use minstant::Instant;

use crate::batch::{Accepted, SequenceCheck, SequenceTracker, StagingBatcher};
use crate::config::{ConfigError, PipelineConfig};
use crate::metrics::{self, PipelineMetrics};
use crate::ring::{CacheMaintenance, DmaRegion, RING_SLOTS, advance, readable, segments};
use crate::trace::{trace, warn};

/// What a single [`RingConsumer::poll`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Fewer than the low watermark readable; nothing touched.
    Idle { readable: usize },
    /// Too far behind; the backlog was discarded and the tail moved to `head`.
    Overrun { skipped: usize },
    /// `head` pointed outside the ring; nothing touched.
    HeadOutOfRange { head: u32 },
    /// `slots` consumed, completing `batches` batches.
    Consumed { slots: usize, batches: usize },
}

/// Consumer side of a [`DmaRegion`].
///
/// `R` is whatever keeps the region alive: a shared-memory mapping, a `Box`,
/// or an `Arc` shared with a simulated producer.
pub struct RingConsumer<R, C, const N: usize = RING_SLOTS>
where
    R: Deref<Target = DmaRegion<N>>,
    C: CacheMaintenance,
{
    region: R,
    cache: C,
    batcher: StagingBatcher,
    metrics: Arc<PipelineMetrics>,
    lanes: Vec<SequenceTracker>,
    tail: usize,
    low_watermark: usize,
    safety_margin: usize,
    overrun_threshold: usize,
}

impl<R, C, const N: usize> RingConsumer<R, C, N>
where
    R: Deref<Target = DmaRegion<N>>,
    C: CacheMaintenance,
{
    /// Starts consuming where the producer was last told the consumer is.
    ///
    /// # Errors
    /// If `config` does not fit a ring of `N` slots.
    pub fn new(
        region: R,
        cache: C,
        config: &PipelineConfig,
        batcher: StagingBatcher,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, ConfigError> {
        config.validate(N)?;
        let acknowledged = region.status.acknowledged_tail() as usize;
        let tail = if acknowledged < N { acknowledged } else { 0 };
        Ok(Self {
            region,
            cache,
            batcher,
            metrics,
            lanes: vec![SequenceTracker::new(); config.channels],
            tail,
            low_watermark: config.low_watermark,
            safety_margin: config.safety_margin,
            overrun_threshold: config.overrun_threshold(N),
        })
    }

    /// Next slot this consumer will read.
    #[inline]
    pub const fn tail(&self) -> usize {
        self.tail
    }

    #[inline]
    pub fn region(&self) -> &DmaRegion<N> {
        &self.region
    }

    #[inline]
    pub const fn batcher(&self) -> &StagingBatcher {
        &self.batcher
    }

    /// Sequence tracking state for `channel`.
    pub fn lane(&self, channel: usize) -> Option<&SequenceTracker> {
        self.lanes.get(channel)
    }

    /// Runs one pass.
    pub fn poll(&mut self) -> PassOutcome {
        metrics::bump(&self.metrics.passes);

        let head = self.region.status.head();
        if head as usize >= N {
            metrics::bump(&self.metrics.head_out_of_range);
            warn!(head, capacity = N, "producer head outside the ring");
            return PassOutcome::HeadOutOfRange { head };
        }

        let readable = readable(head as usize, self.tail, N);
        if readable < self.low_watermark {
            metrics::bump(&self.metrics.idle_passes);
            return PassOutcome::Idle { readable };
        }

        let count = readable - self.safety_margin;
        if count > self.overrun_threshold {
            return self.recover_overrun(head as usize);
        }

        let started = Instant::now();
        let (first, second) = segments(self.tail, count, N);
        self.cache.invalidate(self.region.span(first));
        if let Some(second) = second {
            self.cache.invalidate(self.region.span(second));
        }

        let mut batches = 0;
        for _ in 0..count {
            if self.consume_slot(self.tail) {
                batches += 1;
            }
            self.tail = advance(self.tail, 1, N);
        }

        metrics::add(&self.metrics.slots_consumed, count as u64);
        metrics::add(
            &self.metrics.busy_nanos,
            started.elapsed().as_nanos().try_into().unwrap_or(u64::MAX),
        );
        self.region.status.acknowledge(self.tail as u32);
        trace!(slots = count, batches, tail = self.tail, "pass complete");
        PassOutcome::Consumed {
            slots: count,
            batches,
        }
    }

    fn recover_overrun(&mut self, seen_head: usize) -> PassOutcome {
        // The producer kept going while we decided; jump to where it is now.
        let latest = self.region.status.head() as usize;
        let head = if latest < N { latest } else { seen_head };
        let skipped = readable(head, self.tail, N);

        warn!(
            tail = self.tail,
            head,
            skipped,
            threshold = self.overrun_threshold,
            "consumer overrun, discarding backlog"
        );
        self.tail = head;
        metrics::bump(&self.metrics.overruns);
        metrics::add(&self.metrics.overrun_skipped_slots, skipped as u64);
        metrics::add(&self.metrics.slots_consumed, skipped as u64);
        self.region.status.acknowledge(head as u32);
        PassOutcome::Overrun { skipped }
    }

    /// Returns `true` if the slot completed a batch.
    fn consume_slot(&mut self, position: usize) -> bool {
        let slot = self.region.slot(position);
        let channel = slot.channel_id() as usize;
        if channel >= self.lanes.len() {
            metrics::bump(&self.metrics.invalid_channel_slots);
            warn!(
                channel,
                position,
                channels = self.lanes.len(),
                "slot with invalid channel id skipped"
            );
            return false;
        }
        let lane = &mut self.lanes[channel];

        let check = lane.observe(slot.sequence());
        if let SequenceCheck::Gap { missing, .. } = check {
            metrics::bump(&self.metrics.sequence_gaps);
            metrics::add(&self.metrics.lost_slots, u64::from(missing));
            warn!(channel, position, gap = ?check, "sequence discontinuity");
        }

        let dropped = lane.dropped();
        matches!(
            self.batcher.accept(channel, slot, dropped),
            Accepted::Completed { .. }
        )
    }
}

impl<R, C, const N: usize> std::fmt::Debug for RingConsumer<R, C, N>
where
    R: Deref<Target = DmaRegion<N>>,
    C: CacheMaintenance,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingConsumer")
            .field("capacity", &N)
            .field("tail", &self.tail)
            .field("low_watermark", &self.low_watermark)
            .field("safety_margin", &self.safety_margin)
            .field("overrun_threshold", &self.overrun_threshold)
            .field("batcher", &self.batcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff::HandoffQueue;
    use crate::ring::{FenceOnly, SLOT_SAMPLES, SlotSpan};

    const N: usize = 256;

    type Region = Box<DmaRegion<N>>;

    #[derive(Default)]
    struct Recorder(Vec<(usize, usize)>);

    impl CacheMaintenance for Recorder {
        fn invalidate(&mut self, span: SlotSpan<'_>) {
            self.0.push((span.first(), span.len()));
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            slots_per_batch: 4,
            batch_slots: 8,
            ..PipelineConfig::default()
        }
    }

    fn consumer<C: CacheMaintenance>(region: Region, cache: C) -> RingConsumer<Region, C, N> {
        let config = config();
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = Arc::new(HandoffQueue::new(config.batch_slots));
        let batcher = StagingBatcher::with_pool(&config, queue, Arc::clone(&metrics)).unwrap();
        RingConsumer::new(region, cache, &config, batcher, metrics).unwrap()
    }

    /// Writes `(channel, sequence)` slots starting at the current head and
    /// publishes the new head.
    fn produce(region: &DmaRegion<N>, slots: impl IntoIterator<Item = (u32, u32)>) {
        let samples = [0u32; SLOT_SAMPLES];
        let mut head = region.status.head() as usize;
        for (channel, sequence) in slots {
            region.slot(head).produce(channel, sequence, 0, &samples);
            head = advance(head, 1, N);
        }
        region.status.publish_head(head as u32);
    }

    fn round_robin(from: u32, count: u32) -> impl Iterator<Item = (u32, u32)> {
        (from..from + count).map(|n| (n % 4, n / 4))
    }

    fn snapshot<C: CacheMaintenance>(c: &RingConsumer<Region, C, N>) -> crate::MetricsSnapshot {
        c.metrics.snapshot()
    }

    #[test]
    fn below_watermark_does_nothing() {
        let mut c = consumer(DmaRegion::new_boxed().unwrap(), Recorder::default());
        produce(c.region(), round_robin(0, 31));

        assert_eq!(c.poll(), PassOutcome::Idle { readable: 31 });
        assert_eq!(c.tail(), 0);
        assert_eq!(c.region().status.acknowledged_tail(), 0);
        assert!(c.cache.0.is_empty());
        assert_eq!(snapshot(&c).idle_passes, 1);
    }

    #[test]
    fn consumes_up_to_safety_margin_and_acknowledges() {
        let mut c = consumer(DmaRegion::new_boxed().unwrap(), Recorder::default());
        produce(c.region(), round_robin(0, 40));

        assert_eq!(
            c.poll(),
            PassOutcome::Consumed {
                slots: 24,
                batches: 4
            }
        );
        assert_eq!(c.tail(), 24);
        assert_eq!(c.region().status.acknowledged_tail(), 24);
        assert_eq!(c.cache.0, [(0, 24)]);
        assert_eq!(c.batcher().queue().pending(), 4);

        // 16 left behind the margin: below the watermark now.
        assert_eq!(c.poll(), PassOutcome::Idle { readable: 16 });
    }

    #[test]
    fn overrun_jumps_to_head_once_then_resumes() {
        let mut c = consumer(DmaRegion::new_boxed().unwrap(), Recorder::default());
        produce(c.region(), round_robin(0, 100));

        assert_eq!(c.poll(), PassOutcome::Overrun { skipped: 100 });
        assert_eq!(c.tail(), 100);
        assert_eq!(c.region().status.acknowledged_tail(), 100);
        assert!(c.cache.0.is_empty());

        produce(c.region(), round_robin(100, 40));
        assert!(matches!(
            c.poll(),
            PassOutcome::Consumed { slots: 24, .. }
        ));
        let snap = snapshot(&c);
        assert_eq!(snap.overruns, 1);
        assert_eq!(snap.overrun_skipped_slots, 100);
    }

    #[test]
    fn wrapped_range_is_invalidated_in_two_segments() {
        let region: Region = DmaRegion::new_boxed().unwrap();
        region.status.publish_head(250);
        region.status.acknowledge(250);
        let mut c = consumer(region, Recorder::default());
        produce(c.region(), round_robin(0, 40));

        assert!(matches!(
            c.poll(),
            PassOutcome::Consumed { slots: 24, .. }
        ));
        assert_eq!(c.cache.0, [(250, 6), (0, 18)]);
        assert_eq!(c.tail(), 18);
        assert_eq!(c.region().status.acknowledged_tail(), 18);
    }

    #[test]
    fn invalid_channel_is_skipped_but_tail_advances() {
        let mut c = consumer(DmaRegion::new_boxed().unwrap(), FenceOnly);
        let slots = (0..40u32).map(|n| if n == 5 { (7, 0) } else { (0, n - u32::from(n > 5)) });
        produce(c.region(), slots);

        assert!(matches!(
            c.poll(),
            PassOutcome::Consumed { slots: 24, .. }
        ));
        assert_eq!(c.tail(), 24);
        let snap = snapshot(&c);
        assert_eq!(snap.invalid_channel_slots, 1);
        assert_eq!(snap.sequence_gaps, 0);
        assert_eq!(c.lane(0).and_then(|l| l.last_seen()), Some(22));
    }

    #[test]
    fn sequence_gap_is_counted_and_resynchronized() {
        let mut c = consumer(DmaRegion::new_boxed().unwrap(), FenceOnly);
        let sequences = [0, 1, 2, 5, 6].into_iter().chain(7..42);
        produce(c.region(), sequences.map(|s| (1, s)));

        c.poll();
        let snap = snapshot(&c);
        assert_eq!(snap.sequence_gaps, 1);
        assert_eq!(snap.lost_slots, 2);
        assert_eq!(c.lane(1).unwrap().dropped(), 2);

        // The batch that started before the gap carries the old loss count,
        // the next one the new count.
        let mut batches = Vec::new();
        c.batcher().queue().pop_range(&mut batches);
        assert_eq!(batches[0].header().dropped_count, 0);
        assert_eq!(batches[1].header().dropped_count, 2);
    }

    #[test]
    fn out_of_range_head_is_ignored() {
        let mut c = consumer(DmaRegion::new_boxed().unwrap(), FenceOnly);
        c.region().status.publish_head(N as u32 + 3);
        assert_eq!(
            c.poll(),
            PassOutcome::HeadOutOfRange {
                head: N as u32 + 3
            }
        );
        assert_eq!(c.tail(), 0);
    }

    #[test]
    fn readable_never_exceeds_ring_across_laps() {
        let mut c = consumer(DmaRegion::new_boxed().unwrap(), FenceOnly);
        let mut produced = 0u32;
        for _ in 0..40 {
            produce(c.region(), round_robin(produced, 48));
            produced += 48;
            match c.poll() {
                PassOutcome::Idle { readable } => assert!(readable < N),
                PassOutcome::Consumed { slots, .. } => assert!(slots < N),
                other => panic!("unexpected {other:?}"),
            }
        }
        let snap = snapshot(&c);
        assert_eq!(snap.sequence_gaps, 0);
        assert_eq!(snap.overruns, 0);
        let backlog = readable(c.region().status.head() as usize, c.tail(), N);
        assert_eq!(snap.slots_consumed + backlog as u64, u64::from(produced));
    }
}
