//! 32-byte batch header, little-endian on the wire.
//!
//! ```text
//!  0        4             8               12             16            20           24         32
//!  | magic  | phase_timer | dropped_count | adc_sequence | rx_sequence | channel_id | reserved |
//! ```

/// Marks the start of every batch on the wire.
pub const BATCH_MAGIC: u32 = 0x7ab8_bd6f;

/// Encoded size of [`BatchHeader`].
pub const HEADER_LEN: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchHeader {
    pub magic: u32,
    /// Phase timer of the first slot in the batch.
    pub phase_timer: u32,
    /// Slots lost on this channel (sequence gaps) up to the first slot.
    pub dropped_count: u32,
    /// Sequence counter of the first slot.
    pub adc_sequence: u32,
    /// Global batch counter.
    pub rx_sequence: u32,
    pub channel_id: u32,
    pub reserved: [u32; 2],
}

impl BatchHeader {
    pub const fn new(
        channel_id: u32,
        phase_timer: u32,
        adc_sequence: u32,
        rx_sequence: u32,
        dropped_count: u32,
    ) -> Self {
        Self {
            magic: BATCH_MAGIC,
            phase_timer,
            dropped_count,
            adc_sequence,
            rx_sequence,
            channel_id,
            reserved: [0; 2],
        }
    }

    fn words(&self) -> [u32; 8] {
        [
            self.magic,
            self.phase_timer,
            self.dropped_count,
            self.adc_sequence,
            self.rx_sequence,
            self.channel_id,
            self.reserved[0],
            self.reserved[1],
        ]
    }

    pub fn encode(&self, out: &mut [u8; HEADER_LEN]) {
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.words()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0; HEADER_LEN];
        self.encode(&mut out);
        out
    }

    /// Decodes a header from the front of `bytes`.
    ///
    /// Returns `None` if fewer than [`HEADER_LEN`] bytes are given or the
    /// magic does not match.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let head = bytes.get(..HEADER_LEN)?;
        let mut words = [0u32; 8];
        for (word, chunk) in words.iter_mut().zip(head.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let [magic, phase_timer, dropped_count, adc_sequence, rx_sequence, channel_id, r0, r1] =
            words;
        (magic == BATCH_MAGIC).then_some(Self {
            magic,
            phase_timer,
            dropped_count,
            adc_sequence,
            rx_sequence,
            channel_id,
            reserved: [r0, r1],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_match_wire_layout() {
        let header = BatchHeader::new(3, 0x1111_2222, 40, 7, 5);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0x6f, 0xbd, 0xb8, 0x7a]);
        assert_eq!(&bytes[4..8], &0x1111_2222u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &5u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &40u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &7u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &3u32.to_le_bytes());
        assert_eq!(&bytes[24..32], &[0; 8]);
        assert_eq!(BatchHeader::decode(&bytes), Some(header));
    }

    #[test]
    fn decode_rejects_short_or_foreign_input() {
        assert_eq!(BatchHeader::decode(&[0; 16]), None);
        assert_eq!(BatchHeader::decode(&[0; HEADER_LEN]), None);
    }
}
