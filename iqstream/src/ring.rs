//! Shared producer arena: descriptor ring and status exchange region.
//!
//! The remote DMA engine owns the write side of everything in this module.
//! The host consumer reads slot descriptors and `head`, and writes exactly one
//! field back: the acknowledged tail in [`StatusRegion`].
//!
//! ```text
//!  DmaRegion<N>
//!  ┌───────────────────────────┐
//!  │ StatusRegion (64 B)       │  head: producer-owned (Release / Acquire)
//!  │                           │  consumer_ack_tail: consumer-owned
//!  ├───────────────────────────┤
//!  │ RingSlot[0]   (1088 B)    │  samples[256] + channel/sequence/timer/flags
//!  │ RingSlot[1]               │
//!  │ ...                       │
//!  │ RingSlot[N-1]             │
//!  └───────────────────────────┘
//! ```
//!
//! - [`layout`] - `#[repr(C)]` descriptor types and the arena itself
//! - [`index`] - wraparound arithmetic over slot indices
//! - [`cache`] - cache maintenance before payload reads

pub mod cache;
pub mod index;
pub mod layout;

pub use cache::{CacheMaintenance, FenceOnly, SlotSpan};
pub use index::{advance, readable, segments};
pub use layout::{DmaRegion, RING_SLOTS, RegionAllocError, RingSlot, SLOT_SAMPLES, StatusRegion};

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
pub use cache::DcacheCivac;
