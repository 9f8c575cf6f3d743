//! `#[repr(C)]` layout of the producer arena.
//!
//! Field order and sizes match the co-processor firmware; the compile-time
//! assertions at the bottom of this file pin them down.

use std::alloc::{Layout, alloc_zeroed};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::ipc::shmem::SharedMemorySafe;
use crate::ring::cache::SlotSpan;

/// Slots in the firmware ring (about 40 ms of four-channel capture).
pub const RING_SLOTS: usize = 16 * 1024;

/// Complex samples carried by one slot (one DMA transfer).
pub const SLOT_SAMPLES: usize = 256;

/// Handshake words exchanged with the producer.
///
/// Each field has exactly one writer. `head` is written only by the remote
/// engine and must be read with acquire ordering so that slot payload written
/// before the head advance is visible. `consumer_ack_tail` is written only by
/// the host consumer; the producer side uses it to decide how much of the ring
/// it may reclaim.
#[repr(C)]
#[repr(align(64))]
pub struct StatusRegion {
    /// Transmit-side buffer id. Unused by the receive path.
    pub tx_buf_id: AtomicU32,
    /// Next slot the producer will write.
    pub head: AtomicU32,
    /// Next slot the consumer has not yet processed.
    pub consumer_ack_tail: AtomicU32,
}

impl StatusRegion {
    pub const fn new() -> Self {
        Self {
            tx_buf_id: AtomicU32::new(0),
            head: AtomicU32::new(0),
            consumer_ack_tail: AtomicU32::new(0),
        }
    }

    /// Producer write position, acquire-ordered.
    #[inline]
    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    /// Publishes a new write position. Producer side only.
    #[inline]
    pub fn publish_head(&self, head: u32) {
        self.head.store(head, Ordering::Release);
    }

    /// Writes the consumer's tail back to the producer.
    #[inline]
    pub fn acknowledge(&self, tail: u32) {
        self.consumer_ack_tail.store(tail, Ordering::Release);
    }

    #[inline]
    pub fn acknowledged_tail(&self) -> u32 {
        self.consumer_ack_tail.load(Ordering::Acquire)
    }
}

impl Default for StatusRegion {
    fn default() -> Self {
        Self::new()
    }
}

/// One DMA transfer: 256 complex samples and the producer's tags.
///
/// Each sample is a `u32` holding two left-justified `i16` components,
/// I in the low half and Q in the high half.
#[repr(C)]
pub struct RingSlot {
    samples: [AtomicU32; SLOT_SAMPLES],
    channel_id: AtomicU32,
    phase_timer: AtomicU32,
    sequence: AtomicU32,
    axiq_done: AtomicU32,
    iqcomp_done: AtomicU32,
    read: AtomicU32,
    _pad: [u32; 10],
}

impl RingSlot {
    /// An empty slot, as found in a freshly zeroed arena.
    pub const fn new() -> Self {
        Self {
            samples: [const { AtomicU32::new(0) }; SLOT_SAMPLES],
            channel_id: AtomicU32::new(0),
            phase_timer: AtomicU32::new(0),
            sequence: AtomicU32::new(0),
            axiq_done: AtomicU32::new(0),
            iqcomp_done: AtomicU32::new(0),
            read: AtomicU32::new(0),
            _pad: [0; 10],
        }
    }

    /// Channel tag. Acquire-ordered: the producer stores it last.
    #[inline]
    pub fn channel_id(&self) -> u32 {
        self.channel_id.load(Ordering::Acquire)
    }

    /// Per-channel sequence counter.
    #[inline]
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn phase_timer(&self) -> u32 {
        self.phase_timer.load(Ordering::Relaxed)
    }

    /// Producer completion flags `(axiq_done, iqcomp_done)`.
    #[inline]
    pub fn completion(&self) -> (u32, u32) {
        (
            self.axiq_done.load(Ordering::Acquire),
            self.iqcomp_done.load(Ordering::Acquire),
        )
    }

    /// Copies the sample payload out of the slot.
    #[inline]
    pub fn read_samples(&self, out: &mut [u32; SLOT_SAMPLES]) {
        for (dst, src) in out.iter_mut().zip(&self.samples) {
            *dst = src.load(Ordering::Relaxed);
        }
    }

    /// Fills the slot the way the remote engine does: payload first, then the
    /// tags, then the completion flags and finally the channel id.
    ///
    /// Only meaningful for producer-side code (simulators, loopback tests).
    pub fn produce(&self, channel_id: u32, sequence: u32, phase_timer: u32, samples: &[u32]) {
        for (dst, &src) in self.samples.iter().zip(samples) {
            dst.store(src, Ordering::Relaxed);
        }
        self.phase_timer.store(phase_timer, Ordering::Relaxed);
        self.sequence.store(sequence, Ordering::Relaxed);
        self.read.store(0, Ordering::Relaxed);
        self.axiq_done.store(1, Ordering::Release);
        self.iqcomp_done.store(1, Ordering::Release);
        self.channel_id.store(channel_id, Ordering::Release);
    }
}

impl Default for RingSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// The complete producer arena: status words followed by `N` ring slots.
///
/// The all-zero bit pattern is the initial state (head = tail = 0, every slot
/// empty), which is what a fresh shared-memory object or a zeroed allocation
/// provides.
#[repr(C)]
pub struct DmaRegion<const N: usize = RING_SLOTS> {
    pub status: StatusRegion,
    pub slots: [RingSlot; N],
}

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    const OK: () = assert!(
        N > 0 && N <= u32::MAX as usize,
        "ring capacity must be non-zero and addressable by a u32 head"
    );
}

impl<const N: usize> DmaRegion<N> {
    pub const CAPACITY: usize = {
        let () = CapacityCheck::<N>::OK;
        N
    };

    /// Allocates a zeroed region on the heap.
    ///
    /// The default ring is ~17 MiB, so this never goes through the stack.
    ///
    /// # Errors
    /// Returns [`RegionAllocError`] if the allocator refuses.
    pub fn new_boxed() -> Result<Box<Self>, RegionAllocError> {
        let layout = Layout::new::<Self>();
        // SAFETY: layout has non-zero size (StatusRegion alone is 64 bytes).
        let ptr = unsafe { alloc_zeroed(layout) }.cast::<Self>();
        if ptr.is_null() {
            return Err(RegionAllocError {
                bytes: layout.size(),
            });
        }
        // SAFETY: ptr was allocated with the global allocator using the layout
        // of Self, and all-zero is a valid Self (atomics and plain integers).
        Ok(unsafe { Box::from_raw(ptr) })
    }

    /// Allocates a zeroed region that can be shared with a producer thread.
    ///
    /// # Errors
    /// See [`DmaRegion::new_boxed`].
    pub fn new_shared() -> Result<Arc<Self>, RegionAllocError> {
        Self::new_boxed().map(Arc::from)
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        Self::CAPACITY
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &RingSlot {
        &self.slots[index]
    }

    /// A contiguous run of slots, for cache maintenance.
    #[inline]
    pub fn span(&self, range: Range<usize>) -> SlotSpan<'_> {
        SlotSpan::new(range.start, &self.slots[range])
    }
}

/// Zeroed allocation of a [`DmaRegion`] failed.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("failed to allocate {bytes} bytes for the descriptor ring")]
pub struct RegionAllocError {
    pub bytes: usize,
}

// SAFETY: every field is an atomic or a plain integer; the all-zero pattern is
// valid; no pointers; layout is repr(C).
unsafe impl SharedMemorySafe for StatusRegion {}
// SAFETY: as above.
unsafe impl SharedMemorySafe for RingSlot {}
// SAFETY: repr(C) composition of SharedMemorySafe types.
unsafe impl<const N: usize> SharedMemorySafe for DmaRegion<N> {}

const _: () = assert!(std::mem::size_of::<RingSlot>() == 1088);
const _: () = assert!(std::mem::size_of::<StatusRegion>() == 64);
const _: () = assert!(std::mem::offset_of!(RingSlot, channel_id) == 4 * SLOT_SAMPLES);
