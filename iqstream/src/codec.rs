//! Dense 12-bit packing of complex fixed-point samples.
//!
//! The ADC delivers 12 significant bits per component, left-justified in an
//! `i16`. On the wire each complex sample shrinks from 4 bytes to 3:
//!
//! ```text
//!   sample (u32, LE):   [ Q:16 | I:16 ]
//!   packed (24-bit LE): [ Q >> 4 : 12 | I >> 4 : 12 ]
//! ```
//!
//! Two consecutive packed samples are bit-identical to packing one 64-bit
//! word of four components into 48 bits, which is what the host application
//! unpacks.
//!
//! Every `i16` fits after the shift, so nothing saturates; the low nibble is
//! discarded (rounding toward negative infinity). Values with a zero low
//! nibble round-trip exactly.

use thiserror::Error;

/// Bytes per packed complex sample.
pub const PACKED_SAMPLE_BYTES: usize = 3;

/// Packed size of `samples` complex samples.
#[inline]
#[must_use]
pub const fn packed_len(samples: usize) -> usize {
    samples * PACKED_SAMPLE_BYTES
}

/// Errors from [`pack`] and [`unpack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Output buffer cannot hold the converted input.
    #[error("destination holds {available} units, {required} required")]
    DestinationTooSmall { required: usize, available: usize },
    /// Packed input is not a whole number of samples.
    #[error("packed input of {len} bytes is not a multiple of {PACKED_SAMPLE_BYTES}")]
    Truncated { len: usize },
}

/// Builds a complex sample from its components.
#[inline]
#[must_use]
pub const fn iq(i: i16, q: i16) -> u32 {
    (i as u16 as u32) | ((q as u16 as u32) << 16)
}

/// Splits a complex sample into `(I, Q)`.
#[inline]
#[must_use]
pub const fn split(sample: u32) -> (i16, i16) {
    (sample as u16 as i16, (sample >> 16) as u16 as i16)
}

/// Packs `src` complex samples into `dst`, returning the bytes written.
///
/// # Errors
/// [`CodecError::DestinationTooSmall`] if `dst` is shorter than
/// [`packed_len`]`(src.len())`; nothing is written in that case.
pub fn pack(dst: &mut [u8], src: &[u32]) -> Result<usize, CodecError> {
    let required = packed_len(src.len());
    if dst.len() < required {
        return Err(CodecError::DestinationTooSmall {
            required,
            available: dst.len(),
        });
    }

    for (out, &sample) in dst.chunks_exact_mut(PACKED_SAMPLE_BYTES).zip(src) {
        let i = (sample >> 4) & 0xfff;
        let q = (sample >> 20) & 0xfff;
        let word = i | (q << 12);
        out.copy_from_slice(&word.to_le_bytes()[..PACKED_SAMPLE_BYTES]);
    }

    Ok(required)
}

/// Expands packed bytes back into left-justified complex samples, returning
/// the number of samples written.
///
/// # Errors
/// [`CodecError::Truncated`] if `src` is not a multiple of 3 bytes,
/// [`CodecError::DestinationTooSmall`] if `dst` cannot hold the samples.
pub fn unpack(dst: &mut [u32], src: &[u8]) -> Result<usize, CodecError> {
    if src.len() % PACKED_SAMPLE_BYTES != 0 {
        return Err(CodecError::Truncated { len: src.len() });
    }
    let required = src.len() / PACKED_SAMPLE_BYTES;
    if dst.len() < required {
        return Err(CodecError::DestinationTooSmall {
            required,
            available: dst.len(),
        });
    }

    for (out, bytes) in dst.iter_mut().zip(src.chunks_exact(PACKED_SAMPLE_BYTES)) {
        let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
        let i = (word & 0xfff) << 4;
        let q = ((word >> 12) & 0xfff) << 4;
        *out = i | (q << 16);
    }

    Ok(required)
}
