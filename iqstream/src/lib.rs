//! Host-side consumer for a DMA-filled, multi-channel ADC descriptor ring.
//!
//! A remote engine writes 256-sample slots into a shared ring and advances
//! `head`; this crate polls the ring, demultiplexes slots by channel, packs
//! them into fixed-size batches and hands the batches to a bulk transport.
//! See [`pipeline`] for how the pieces fit together.

pub mod batch;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod handoff;
pub mod ipc;
pub mod metrics;
pub mod pipeline;
pub mod ring;
pub mod sim;
pub mod trace;
pub mod transport;

pub use batch::{BatchHeader, StagingBatch, StagingBatcher};
pub use config::{Placement, PipelineConfig, PollCadence};
pub use consumer::{PassOutcome, RingConsumer};
pub use handoff::HandoffQueue;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{Pipeline, PipelineError};
pub use ring::{CacheMaintenance, DmaRegion, FenceOnly};
pub use trace::init_tracing;
pub use transport::{BulkEndpoint, RequestHandle, TransferStatus, TransportPump};

#[doc(inline)]
pub use ipc::shmem::SharedMemorySafe;

pub use serde::{Deserialize, Serialize};
