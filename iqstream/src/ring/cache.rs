//! Cache maintenance over ring slots.
//!
//! The producer writes slots from a domain that does not snoop the host's
//! data cache. Before the consumer reads a run of slots it must drop any stale
//! lines covering them; otherwise it can observe a previous lap's payload
//! alongside a fresh `head`.

use std::sync::atomic::{Ordering, fence};

use crate::ring::layout::RingSlot;

/// A contiguous run of ring slots, `first..first + slots.len()`.
#[derive(Clone, Copy)]
pub struct SlotSpan<'a> {
    first: usize,
    slots: &'a [RingSlot],
}

impl<'a> SlotSpan<'a> {
    pub(crate) const fn new(first: usize, slots: &'a [RingSlot]) -> Self {
        Self { first, slots }
    }

    /// Ring index of the first slot in the span.
    #[inline]
    pub const fn first(&self) -> usize {
        self.first
    }

    /// Number of slots.
    #[inline]
    pub const fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Address of the first byte covered.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.slots.as_ptr().cast()
    }

    /// Number of bytes covered.
    #[inline]
    pub const fn byte_len(&self) -> usize {
        std::mem::size_of_val(self.slots)
    }
}

/// Makes producer writes to a span visible to this core.
///
/// Called once per contiguous segment, before any payload in it is read.
/// Implementations must be idempotent: invalidating a span twice without new
/// producer writes must not change what the consumer observes.
pub trait CacheMaintenance {
    fn invalidate(&mut self, span: SlotSpan<'_>);
}

impl<C: CacheMaintenance + ?Sized> CacheMaintenance for &mut C {
    fn invalidate(&mut self, span: SlotSpan<'_>) {
        (**self).invalidate(span);
    }
}

/// For coherent hosts (x86, or a mapping the kernel keeps coherent).
///
/// Only an acquire fence is issued so that payload reads are not hoisted above
/// the `head` load.
#[derive(Debug, Default, Clone, Copy)]
pub struct FenceOnly;

impl CacheMaintenance for FenceOnly {
    #[inline]
    fn invalidate(&mut self, _span: SlotSpan<'_>) {
        fence(Ordering::Acquire);
    }
}

/// Clean-and-invalidate by virtual address on aarch64 (`dc civac`).
///
/// `dc ivac` is not available at EL0. The consumer never writes ring slots,
/// so their lines are never dirty and the clean half is a no-op in practice.
#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
#[derive(Debug, Clone, Copy)]
pub struct DcacheCivac {
    line: usize,
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
impl DcacheCivac {
    /// Reads the minimum data cache line size from `CTR_EL0`.
    pub fn new() -> Self {
        let ctr: u64;
        // SAFETY: CTR_EL0 is readable from EL0 on Linux (SCTLR_EL1.UCT is set).
        unsafe {
            std::arch::asm!("mrs {0}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
        }
        let dminline = (ctr >> 16) & 0xf;
        Self {
            line: 4usize << dminline,
        }
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
impl Default for DcacheCivac {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
impl CacheMaintenance for DcacheCivac {
    fn invalidate(&mut self, span: SlotSpan<'_>) {
        if span.is_empty() {
            return;
        }
        let start = span.as_ptr() as usize & !(self.line - 1);
        let end = span.as_ptr() as usize + span.byte_len();
        let mut addr = start;
        while addr < end {
            // SAFETY: addr lies within (or on the line containing) memory we
            // have a shared reference to; the instruction does not change it.
            unsafe {
                std::arch::asm!("dc civac, {0}", in(reg) addr, options(nostack, preserves_flags));
            }
            addr += self.line;
        }
        // SAFETY: barrier only.
        unsafe {
            std::arch::asm!("dsb ish", options(nostack, preserves_flags));
        }
        fence(Ordering::Acquire);
    }
}
