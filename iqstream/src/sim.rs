//! A software stand-in for the remote DMA engine.
//!
//! [`SyntheticProducer`] fills ring slots the way the firmware does: channels
//! in round-robin order, a per-channel sequence counter, a free-running phase
//! timer, and `head` published only after the payload. It can inject sequence
//! gaps to exercise loss accounting. Like the real engine it never looks at
//! the consumer's acknowledged tail.

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use crate::codec::iq;
use crate::ring::{DmaRegion, RING_SLOTS, SLOT_SAMPLES, advance};
use crate::trace::{debug, info};

/// Phase timer ticks per slot (256 samples at the 122.88 MHz timer and
/// 61.44 Msps capture rate).
const TICKS_PER_SLOT: u32 = 512;

/// Slots written between `head` publications.
const BURST: usize = 16;

pub struct SyntheticProducer<R, const N: usize = RING_SLOTS>
where
    R: Deref<Target = DmaRegion<N>>,
{
    region: R,
    channels: u32,
    head: usize,
    produced: u64,
    sequences: Vec<u32>,
    phase_timer: u32,
    drop_every: Option<u64>,
    injected_gaps: u64,
    samples: Box<[u32; SLOT_SAMPLES]>,
}

impl<R, const N: usize> SyntheticProducer<R, N>
where
    R: Deref<Target = DmaRegion<N>>,
{
    /// Continues from the region's current `head`.
    pub fn new(region: R, channels: u32) -> Self {
        let head = region.status.head() as usize % N;
        Self {
            region,
            channels: channels.max(1),
            head,
            produced: 0,
            sequences: vec![0; channels.max(1) as usize],
            phase_timer: 0,
            drop_every: None,
            injected_gaps: 0,
            samples: Box::new([0; SLOT_SAMPLES]),
        }
    }

    /// Skips one sequence number on every `k`-th slot, as if the engine had
    /// overwritten a slot of that channel. `0` disables injection.
    #[must_use]
    pub fn with_drop_every(mut self, k: u64) -> Self {
        self.drop_every = (k > 0).then_some(k);
        self
    }

    /// Slots written so far.
    #[inline]
    pub const fn produced(&self) -> u64 {
        self.produced
    }

    /// Sequence numbers skipped by injection so far.
    #[inline]
    pub const fn injected_gaps(&self) -> u64 {
        self.injected_gaps
    }

    #[inline]
    pub fn region(&self) -> &DmaRegion<N> {
        &self.region
    }

    /// Writes `count` slots and publishes the new `head` once.
    pub fn produce(&mut self, count: usize) {
        for _ in 0..count {
            self.write_slot();
        }
        self.region.status.publish_head(self.head as u32);
    }

    fn write_slot(&mut self) {
        let channel = (self.produced % u64::from(self.channels)) as u32;
        self.produced += 1;

        let sequence = &mut self.sequences[channel as usize];
        if let Some(k) = self.drop_every
            && self.produced % k == 0
        {
            *sequence = sequence.wrapping_add(1);
            self.injected_gaps += 1;
        }
        let this_sequence = *sequence;
        *sequence = sequence.wrapping_add(1);

        fill_tone(&mut self.samples, channel, this_sequence);
        self.region
            .slot(self.head)
            .produce(channel, this_sequence, self.phase_timer, &self.samples[..]);
        self.phase_timer = self.phase_timer.wrapping_add(TICKS_PER_SLOT);
        self.head = advance(self.head, 1, N);
    }
}

impl<R, const N: usize> SyntheticProducer<R, N>
where
    R: Deref<Target = DmaRegion<N>> + Send + 'static,
{
    /// Runs the producer on its own thread at `rate` slots per second until
    /// `shutdown` is set. The thread returns the number of slots written.
    ///
    /// # Errors
    /// If the thread cannot be spawned.
    pub fn spawn(
        mut self,
        rate: u64,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<u64>> {
        let rate = rate.max(1);
        thread::Builder::new()
            .name("iqstream-producer".into())
            .spawn(move || {
                info!(rate, channels = self.channels, "synthetic producer started");
                let start = Instant::now();
                while !shutdown.load(Ordering::Relaxed) {
                    self.produce(BURST);
                    let due = Duration::from_secs_f64(self.produced as f64 / rate as f64);
                    let elapsed = start.elapsed();
                    if due > elapsed {
                        thread::sleep(due - elapsed);
                    }
                }
                debug!(
                    produced = self.produced,
                    injected_gaps = self.injected_gaps,
                    "synthetic producer exiting"
                );
                self.produced
            })
    }
}

/// A slowly rotating tone, distinct per channel, with the low nibble clear so
/// it survives 12-bit packing unchanged.
fn fill_tone(samples: &mut [u32; SLOT_SAMPLES], channel: u32, sequence: u32) {
    let base = sequence.wrapping_mul(SLOT_SAMPLES as u32);
    for (k, sample) in samples.iter_mut().enumerate() {
        let phase = base.wrapping_add(k as u32).wrapping_mul(channel + 1);
        let i = ((phase & 0xfff) as i16).wrapping_sub(0x800) << 4;
        let q = (((phase >> 2) & 0xfff) as i16).wrapping_sub(0x800) << 4;
        *sample = iq(i, q);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{SequenceCheck, SequenceTracker};
    use crate::codec::split;

    #[test]
    fn writes_round_robin_and_publishes_head() {
        let region = DmaRegion::<64>::new_boxed().unwrap();
        let mut producer = SyntheticProducer::new(region, 4);
        producer.produce(10);

        let region = producer.region();
        assert_eq!(region.status.head(), 10);
        let tags: Vec<_> = (0..10)
            .map(|n| (region.slot(n).channel_id(), region.slot(n).sequence()))
            .collect();
        assert_eq!(tags[..6], [(0, 0), (1, 0), (2, 0), (3, 0), (0, 1), (1, 1)]);
        assert_eq!(region.slot(1).phase_timer(), TICKS_PER_SLOT);
    }

    #[test]
    fn head_wraps_around_the_ring() {
        let region = DmaRegion::<64>::new_boxed().unwrap();
        let mut producer = SyntheticProducer::new(region, 4);
        producer.produce(70);
        assert_eq!(producer.region().status.head(), 6);
    }

    #[test]
    fn injected_drops_show_up_as_gaps() {
        let region = DmaRegion::<64>::new_boxed().unwrap();
        let mut producer = SyntheticProducer::new(region, 1).with_drop_every(10);
        producer.produce(30);

        let mut tracker = SequenceTracker::new();
        let gaps = (0..30)
            .map(|n| tracker.observe(producer.region().slot(n).sequence()))
            .filter(|c| matches!(c, SequenceCheck::Gap { .. }))
            .count();
        assert_eq!(gaps as u64, producer.injected_gaps());
        assert_eq!(gaps, 3);
        assert_eq!(tracker.dropped(), 3);
    }

    #[test]
    fn tone_has_clear_low_nibbles() {
        let mut samples = [0; SLOT_SAMPLES];
        fill_tone(&mut samples, 3, 17);
        for sample in samples {
            let (i, q) = split(sample);
            assert_eq!(i & 0xf, 0);
            assert_eq!(q & 0xf, 0);
        }
    }
}
