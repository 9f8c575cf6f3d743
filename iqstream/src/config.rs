//! Pipeline tuning.
//!
//! Defaults reproduce the capture device's firmware contract; change them only
//! together with the producer.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Channels multiplexed onto the ring.
pub const CHANNELS: usize = 4;

/// Below this many readable slots a pass does nothing. The producer's
/// ping-pong DMA trails `head` by up to half of this.
pub const LOW_WATERMARK: usize = 32;

/// Slots left unconsumed behind `head` on every pass.
pub const SAFETY_MARGIN: usize = 16;

/// Ring slots accumulated into one transport batch.
pub const SLOTS_PER_BATCH: usize = 128;

/// Batch slots in the handoff queue.
pub const BATCH_SLOTS: usize = 128;

/// How the poll thread paces itself between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollCadence {
    /// Yield to the scheduler and poll again immediately.
    Spin,
    /// Park for at most this long; a transport completion may wake it early.
    Interval(Duration),
}

/// Core placement of the poll thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    /// Leave scheduling to the OS.
    #[default]
    Unpinned,
    /// Pick a core from the detected topology.
    Auto,
    /// Pin to this core id.
    Core(usize),
}

/// Configuration for [`crate::pipeline::Pipeline`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Valid channel ids are `0..channels`.
    pub channels: usize,
    pub low_watermark: usize,
    pub safety_margin: usize,
    /// Backlog beyond which the consumer jumps to `head`.
    /// `None` means a quarter of the ring.
    pub overrun_threshold: Option<usize>,
    pub slots_per_batch: usize,
    pub batch_slots: usize,
    pub cadence: PollCadence,
    /// Where the poll thread runs.
    pub placement: Placement,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channels: CHANNELS,
            low_watermark: LOW_WATERMARK,
            safety_margin: SAFETY_MARGIN,
            overrun_threshold: None,
            slots_per_batch: SLOTS_PER_BATCH,
            batch_slots: BATCH_SLOTS,
            cadence: PollCadence::Spin,
            placement: Placement::Unpinned,
        }
    }
}

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("at least one channel is required")]
    NoChannels,
    #[error("low watermark {low_watermark} is below the safety margin {safety_margin}")]
    WatermarkBelowMargin {
        low_watermark: usize,
        safety_margin: usize,
    },
    #[error("low watermark {low_watermark} does not fit a ring of {capacity} slots")]
    WatermarkTooLarge { low_watermark: usize, capacity: usize },
    #[error("overrun threshold {threshold} must be in 1..{capacity}")]
    OverrunThreshold { threshold: usize, capacity: usize },
    #[error("slots per batch and batch slots must be non-zero")]
    EmptyBatch,
}

impl PipelineConfig {
    /// Effective overrun threshold for a ring of `capacity` slots.
    #[must_use]
    pub fn overrun_threshold(&self, capacity: usize) -> usize {
        self.overrun_threshold.unwrap_or(capacity / 4)
    }

    /// Checks the configuration against a ring of `capacity` slots.
    ///
    /// # Errors
    /// The first inconsistency found.
    pub fn validate(&self, capacity: usize) -> Result<(), ConfigError> {
        if self.channels == 0 {
            return Err(ConfigError::NoChannels);
        }
        if self.low_watermark < self.safety_margin {
            return Err(ConfigError::WatermarkBelowMargin {
                low_watermark: self.low_watermark,
                safety_margin: self.safety_margin,
            });
        }
        if self.low_watermark >= capacity {
            return Err(ConfigError::WatermarkTooLarge {
                low_watermark: self.low_watermark,
                capacity,
            });
        }
        let threshold = self.overrun_threshold(capacity);
        if threshold == 0 || threshold >= capacity {
            return Err(ConfigError::OverrunThreshold {
                threshold,
                capacity,
            });
        }
        if self.slots_per_batch == 0 || self.batch_slots == 0 {
            return Err(ConfigError::EmptyBatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RING_SLOTS;

    #[test]
    fn defaults_are_valid_for_the_firmware_ring() {
        let config = PipelineConfig::default();
        assert_eq!(config.validate(RING_SLOTS), Ok(()));
        assert_eq!(config.overrun_threshold(RING_SLOTS), RING_SLOTS / 4);
    }

    #[test]
    fn watermark_must_cover_margin() {
        let config = PipelineConfig {
            low_watermark: 8,
            ..PipelineConfig::default()
        };
        assert_eq!(
            config.validate(RING_SLOTS),
            Err(ConfigError::WatermarkBelowMargin {
                low_watermark: 8,
                safety_margin: 16
            })
        );
    }

    #[test]
    fn small_ring_rejects_default_watermark() {
        assert!(matches!(
            PipelineConfig::default().validate(32),
            Err(ConfigError::WatermarkTooLarge { .. })
        ));
    }

    #[test]
    fn tiny_ring_has_no_overrun_threshold() {
        let config = PipelineConfig {
            low_watermark: 2,
            safety_margin: 1,
            ..PipelineConfig::default()
        };
        assert_eq!(
            config.validate(3),
            Err(ConfigError::OverrunThreshold {
                threshold: 0,
                capacity: 3
            })
        );
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "channels": 2, "placement": { "Core": 3 } }"#).unwrap();
        assert_eq!(config.channels, 2);
        assert_eq!(config.placement, Placement::Core(3));
        assert_eq!(config.slots_per_batch, SLOTS_PER_BATCH);
    }

    #[test]
    fn empty_batches_rejected() {
        let config = PipelineConfig {
            slots_per_batch: 0,
            ..PipelineConfig::default()
        };
        assert_eq!(config.validate(RING_SLOTS), Err(ConfigError::EmptyBatch));
    }
}
