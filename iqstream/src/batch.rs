//! Per-channel staging of ring slots into transport batches.
//!
//! Each channel accumulates `slots_per_batch` consecutive slots into one
//! [`StagingBatch`]: a [`BatchHeader`] followed by the packed payload of every
//! slot. Batches are owned buffers that circulate between the batcher, the
//! [`HandoffQueue`] and the transport; the batcher claims a buffer from the
//! queue when a channel starts a batch and pushes it back when it is full.
//!
//! - [`header`] - wire header
//! - [`sequence`] - gap detection on the per-channel sequence counter

pub mod header;
pub mod sequence;

use std::collections::TryReserveError;
use std::sync::Arc;

pub use header::{BATCH_MAGIC, BatchHeader, HEADER_LEN};
pub use sequence::{SequenceCheck, SequenceTracker};

use crate::codec::{self, CodecError};
use crate::config::PipelineConfig;
use crate::handoff::HandoffQueue;
use crate::metrics::{self, PipelineMetrics};
use crate::ring::{RingSlot, SLOT_SAMPLES};
use crate::trace::{debug, error, warn};

/// Packed size of one ring slot.
pub const PACKED_SLOT_BYTES: usize = codec::packed_len(SLOT_SAMPLES);

/// Header plus the packed payload of up to `capacity` ring slots.
pub struct StagingBatch {
    header: BatchHeader,
    bytes: Vec<u8>,
    capacity: usize,
    fill: usize,
    pool_slot: usize,
}

impl StagingBatch {
    /// Allocates a batch for `capacity` slots.
    ///
    /// # Errors
    /// If the allocator cannot provide the buffer.
    pub fn try_new(capacity: usize) -> Result<Self, TryReserveError> {
        let len = HEADER_LEN + capacity * PACKED_SLOT_BYTES;
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(len)?;
        bytes.resize(len, 0);
        Ok(Self {
            header: BatchHeader::default(),
            bytes,
            capacity,
            fill: 0,
            pool_slot: 0,
        })
    }

    #[inline]
    pub const fn header(&self) -> &BatchHeader {
        &self.header
    }

    /// Slots packed so far.
    #[inline]
    pub const fn fill(&self) -> usize {
        self.fill
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub const fn is_full(&self) -> bool {
        self.fill == self.capacity
    }

    /// Index of this buffer in the pool, fixed at allocation.
    #[inline]
    pub const fn pool_slot(&self) -> usize {
        self.pool_slot
    }

    /// Encoded header.
    pub fn header_bytes(&self) -> &[u8] {
        &self.bytes[..HEADER_LEN]
    }

    /// Packed payload of the slots filled so far.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..HEADER_LEN + self.fill * PACKED_SLOT_BYTES]
    }

    /// Header followed by payload, as sent on the wire.
    pub fn as_wire(&self) -> &[u8] {
        &self.bytes[..HEADER_LEN + self.fill * PACKED_SLOT_BYTES]
    }

    fn start(&mut self, header: BatchHeader) {
        self.header = header;
        self.fill = 0;
        self.encode_header();
    }

    /// Numbers the batch in send order.
    fn seal(&mut self, rx_sequence: u32) {
        self.header.rx_sequence = rx_sequence;
        self.encode_header();
    }

    fn encode_header(&mut self) {
        let mut encoded = [0; HEADER_LEN];
        self.header.encode(&mut encoded);
        self.bytes[..HEADER_LEN].copy_from_slice(&encoded);
    }

    fn push_slot(&mut self, samples: &[u32]) -> Result<(), CodecError> {
        let offset = HEADER_LEN + self.fill * PACKED_SLOT_BYTES;
        let dst = self.bytes.get_mut(offset..).unwrap_or_default();
        codec::pack(dst, samples)?;
        self.fill += 1;
        Ok(())
    }
}

impl std::fmt::Debug for StagingBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBatch")
            .field("header", &self.header)
            .field("fill", &self.fill)
            .field("capacity", &self.capacity)
            .field("pool_slot", &self.pool_slot)
            .finish()
    }
}

/// What [`StagingBatcher::accept`] did with a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Packed into the channel's active batch.
    Staged,
    /// Packed, and the batch it completed went to the handoff queue.
    Completed { rx_sequence: u32 },
    /// No buffer was free; the slot was dropped.
    Starved,
}

#[derive(Default)]
struct Lane {
    active: Option<Box<StagingBatch>>,
}

pub type BatchQueue = HandoffQueue<Box<StagingBatch>>;

/// Accumulates slots per channel and hands full batches to the queue.
///
/// Single-threaded: only the poll thread calls into it. The queue is the only
/// state shared with the transport.
pub struct StagingBatcher {
    queue: Arc<BatchQueue>,
    metrics: Arc<PipelineMetrics>,
    lanes: Vec<Lane>,
    slots_per_batch: usize,
    rx_sequence: u32,
    scratch: Box<[u32; SLOT_SAMPLES]>,
}

impl StagingBatcher {
    /// Allocates `batch_slots + channels` buffers and stocks `queue` with
    /// them.
    ///
    /// The extra buffer per channel lets every channel fill a batch while the
    /// queue is full. Each buffer keeps its pool index for life; the queue
    /// hands them back in the order they were retired, so reuse cycles
    /// through the pool.
    ///
    /// # Errors
    /// If any buffer cannot be allocated.
    pub fn with_pool(
        config: &PipelineConfig,
        queue: Arc<BatchQueue>,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, TryReserveError> {
        let pool_size = config.batch_slots + config.channels;
        let mut pool = Vec::new();
        pool.try_reserve_exact(pool_size)?;
        for pool_slot in 0..pool_size {
            let mut batch = StagingBatch::try_new(config.slots_per_batch)?;
            batch.pool_slot = pool_slot;
            pool.push(Box::new(batch));
        }
        queue.stock(pool);
        debug!(
            pool_size,
            bytes_per_batch = HEADER_LEN + config.slots_per_batch * PACKED_SLOT_BYTES,
            "allocated batch pool"
        );

        Ok(Self {
            queue,
            metrics,
            lanes: (0..config.channels).map(|_| Lane::default()).collect(),
            slots_per_batch: config.slots_per_batch,
            rx_sequence: 0,
            scratch: Box::new([0; SLOT_SAMPLES]),
        })
    }

    #[inline]
    pub fn queue(&self) -> &Arc<BatchQueue> {
        &self.queue
    }

    /// Batches completed so far; the next one pushed gets this `rx_sequence`.
    #[inline]
    pub const fn rx_sequence(&self) -> u32 {
        self.rx_sequence
    }

    /// Slots staged in `channel`'s active batch.
    pub fn fill(&self, channel: usize) -> usize {
        self.lanes
            .get(channel)
            .and_then(|lane| lane.active.as_ref())
            .map_or(0, |batch| batch.fill())
    }

    /// Packs `slot` into `channel`'s active batch.
    ///
    /// The first slot of a batch claims a buffer and stamps the header;
    /// `dropped` is the channel's cumulative loss count at that point. The
    /// slot that fills the batch numbers it with the next `rx_sequence` and
    /// pushes it to the handoff queue, so the counter follows wire order.
    ///
    /// `channel` must be below the configured channel count.
    pub fn accept(&mut self, channel: usize, slot: &RingSlot, dropped: u32) -> Accepted {
        let Some(lane) = self.lanes.get_mut(channel) else {
            warn!(channel, "slot for unknown channel reached the batcher");
            return Accepted::Starved;
        };

        let mut batch = match lane.active.take() {
            Some(batch) => batch,
            None => {
                let Some(mut batch) = self.queue.reclaim() else {
                    metrics::bump(&self.metrics.starved_slots);
                    warn!(channel, "every batch buffer is in flight, dropping slot");
                    return Accepted::Starved;
                };
                batch.start(BatchHeader::new(
                    channel as u32,
                    slot.phase_timer(),
                    slot.sequence(),
                    0,
                    dropped,
                ));
                batch
            }
        };

        slot.read_samples(&mut self.scratch);
        if let Err(_err) = batch.push_slot(&self.scratch[..]) {
            error!(channel, err = %_err, "batch buffer shorter than its capacity");
        }

        if batch.fill() < self.slots_per_batch {
            lane.active = Some(batch);
            return Accepted::Staged;
        }

        let rx_sequence = self.rx_sequence;
        self.rx_sequence = rx_sequence.wrapping_add(1);
        batch.seal(rx_sequence);
        self.queue.push(batch);
        metrics::bump(&self.metrics.batches_completed);
        Accepted::Completed { rx_sequence }
    }
}

impl std::fmt::Debug for StagingBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBatcher")
            .field("channels", &self.lanes.len())
            .field("slots_per_batch", &self.slots_per_batch)
            .field("rx_sequence", &self.rx_sequence)
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{iq, unpack};

    fn batcher(channels: usize, slots_per_batch: usize, batch_slots: usize) -> StagingBatcher {
        let config = PipelineConfig {
            channels,
            slots_per_batch,
            batch_slots,
            ..PipelineConfig::default()
        };
        StagingBatcher::with_pool(
            &config,
            Arc::new(HandoffQueue::new(batch_slots)),
            Arc::new(PipelineMetrics::new()),
        )
        .unwrap()
    }

    fn slot(channel: u32, sequence: u32) -> RingSlot {
        let slot = RingSlot::default();
        let fill = iq((sequence as i16) << 4, -((channel as i16) << 4));
        slot.produce(channel, sequence, 1000 + sequence, &[fill; SLOT_SAMPLES]);
        slot
    }

    fn drain(batcher: &StagingBatcher) -> Vec<Box<StagingBatch>> {
        let mut out = Vec::new();
        batcher.queue().pop_range(&mut out);
        out
    }

    #[test]
    fn emits_floor_of_total_over_m_batches_in_slot_order() {
        const M: usize = 4;
        let mut batcher = batcher(1, M, 8);
        let total = 4 * M + 3;
        for seq in 0..total as u32 {
            batcher.accept(0, &slot(0, seq), 0);
        }

        let batches = drain(&batcher);
        assert_eq!(batches.len(), total / M);
        assert_eq!(batcher.fill(0), total % M);

        let mut samples = vec![0u32; SLOT_SAMPLES];
        for (n, batch) in batches.iter().enumerate() {
            assert!(batch.is_full());
            assert_eq!(batch.header().adc_sequence, (n * M) as u32);
            assert_eq!(batch.header().rx_sequence, n as u32);
            for (k, packed) in batch.payload().chunks_exact(PACKED_SLOT_BYTES).enumerate() {
                unpack(&mut samples, packed).unwrap();
                let expected = iq(((n * M + k) as i16) << 4, 0);
                assert!(samples.iter().all(|&s| s == expected));
            }
        }
    }

    #[test]
    fn first_entry_stamps_header() {
        let mut batcher = batcher(4, 2, 8);
        assert_eq!(batcher.accept(2, &slot(2, 7), 3), Accepted::Staged);
        assert_eq!(
            batcher.accept(2, &slot(2, 8), 9),
            Accepted::Completed { rx_sequence: 0 }
        );

        let batches = drain(&batcher);
        let header = BatchHeader::decode(batches[0].as_wire()).unwrap();
        assert_eq!(header, BatchHeader::new(2, 1007, 7, 0, 3));
        assert_eq!(batches[0].as_wire().len(), HEADER_LEN + 2 * PACKED_SLOT_BYTES);
    }

    #[test]
    fn channels_fill_independently() {
        let mut batcher = batcher(4, 2, 8);
        batcher.accept(0, &slot(0, 0), 0);
        batcher.accept(1, &slot(1, 0), 0);
        batcher.accept(1, &slot(1, 1), 0);
        assert_eq!(batcher.fill(0), 1);
        assert_eq!(batcher.fill(1), 0);

        let batches = drain(&batcher);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].header().channel_id, 1);
        assert_eq!(batches[0].header().rx_sequence, 0);
    }

    #[test]
    fn rx_sequence_follows_completion_order() {
        let mut batcher = batcher(2, 2, 8);
        assert_eq!(batcher.accept(0, &slot(0, 0), 0), Accepted::Staged);
        assert_eq!(batcher.accept(1, &slot(1, 0), 0), Accepted::Staged);
        assert_eq!(
            batcher.accept(1, &slot(1, 1), 0),
            Accepted::Completed { rx_sequence: 0 }
        );
        assert_eq!(
            batcher.accept(0, &slot(0, 1), 0),
            Accepted::Completed { rx_sequence: 1 }
        );

        let wire: Vec<_> = drain(&batcher)
            .iter()
            .map(|batch| {
                let header = BatchHeader::decode(batch.as_wire()).unwrap();
                assert_eq!(&header, batch.header());
                (header.channel_id, header.rx_sequence)
            })
            .collect();
        assert_eq!(wire, [(1, 0), (0, 1)]);
    }

    #[test]
    fn live_batches_hold_distinct_pool_slots() {
        let mut batcher = batcher(4, 2, 2);
        for channel in 0..4 {
            batcher.accept(channel as usize, &slot(channel, 0), 0);
        }
        let mut slots: Vec<_> = batcher
            .lanes
            .iter()
            .filter_map(|lane| lane.active.as_ref().map(|b| b.pool_slot()))
            .collect();
        slots.sort_unstable();
        assert_eq!(slots, [0, 1, 2, 3]);
    }

    #[test]
    fn buffers_are_reused_round_robin() {
        const POOL: usize = 4 + 1;
        let mut batcher = batcher(1, 1, 4);
        let mut addresses = [None; POOL];
        for seq in 0..3 * POOL as u32 {
            batcher.accept(0, &slot(0, seq), 0);
            let batch = drain(&batcher).pop().unwrap();
            assert_eq!(batch.pool_slot(), seq as usize % POOL);

            let address = batch.as_wire().as_ptr();
            let seen = addresses[batch.pool_slot()].get_or_insert(address);
            assert_eq!(*seen, address, "pool slot changed buffers");
            batcher.queue().retire(batch);
        }
    }

    #[test]
    fn full_queue_overwrites_instead_of_blocking() {
        let mut batcher = batcher(1, 1, 2);
        for seq in 0..5 {
            batcher.accept(0, &slot(0, seq), 0);
        }
        let queue = batcher.queue();
        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.overflows(), 3);
        let batches = drain(&batcher);
        assert_eq!(batches[1].header().adc_sequence, 4);
    }

    #[test]
    fn one_batch_past_queue_capacity_overflows_once() {
        const BATCH_SLOTS: usize = 4;
        let mut batcher = batcher(1, 1, BATCH_SLOTS);
        for seq in 0..=BATCH_SLOTS as u32 {
            batcher.accept(0, &slot(0, seq), 0);
        }
        let queue = batcher.queue();
        assert_eq!(queue.overflows(), 1);
        assert_eq!(queue.pending(), BATCH_SLOTS);

        let starts: Vec<_> = drain(&batcher)
            .iter()
            .map(|b| b.header().adc_sequence)
            .collect();
        assert_eq!(starts, [1, 2, 3, 4]);
    }

    #[test]
    fn starves_when_every_buffer_is_in_flight() {
        let mut batcher = batcher(1, 1, 2);
        let mut in_flight = Vec::new();
        for seq in 0..3 {
            batcher.accept(0, &slot(0, seq), 0);
            batcher.queue().pop_range(&mut in_flight);
        }
        assert_eq!(batcher.accept(0, &slot(0, 3), 0), Accepted::Starved);
        assert_eq!(batcher.metrics.snapshot().starved_slots, 1);

        batcher.queue().retire(in_flight.remove(0));
        assert!(matches!(
            batcher.accept(0, &slot(0, 4), 0),
            Accepted::Completed { .. }
        ));
    }
}
