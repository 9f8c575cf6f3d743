//! Assembly of the receive pipeline.
//!
//! [`Pipeline::spawn`] wires the pieces together and starts one thread:
//!
//! ```text
//!                 poll thread ("iqstream-poll")
//!  DmaRegion ──> RingConsumer ──> StagingBatcher ──push──> HandoffQueue
//!                                                            │    ^
//!                                         pop_range / submit │    │ retire
//!                                                            v    │
//!                                      caller's thread: TransportPump ──> BulkEndpoint
//! ```
//!
//! The transport side is driven by the caller: build a pump with
//! [`Pipeline::transport`], call [`TransportPump::pump`] when convenient and
//! feed endpoint completions to [`TransportPump::on_complete`].

pub mod placement;

use std::collections::TryReserveError;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, Thread};

use crate::batch::{BatchQueue, StagingBatcher};
use crate::config::{ConfigError, PipelineConfig, PollCadence};
use crate::consumer::RingConsumer;
use crate::handoff::HandoffQueue;
use crate::ipc::shmem::ShmError;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::ring::{CacheMaintenance, DmaRegion, RegionAllocError};
use crate::trace::{debug, error, info, warn};
use crate::transport::{BulkEndpoint, TransportPump};

/// Setup failures. Nothing after a successful spawn is fallible.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to allocate batch pool")]
    Alloc(#[from] TryReserveError),
    #[error(transparent)]
    Region(#[from] RegionAllocError),
    #[error("failed to map producer arena: {0}")]
    Shm(#[from] ShmError),
    #[error("failed to spawn poll thread")]
    Spawn(#[source] std::io::Error),
}

/// Handle to a running pipeline.
///
/// Dropping the handle signals shutdown but does not wait for the poll thread.
/// Use [`Pipeline::shutdown`] to join it.
pub struct Pipeline {
    shutdown_flag: Arc<AtomicBool>,
    poll_handle: Option<JoinHandle<()>>,
    waker: Thread,
    handoff: Arc<BatchQueue>,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    /// Starts consuming `region`.
    ///
    /// # Errors
    /// If `config` does not fit a ring of `N` slots, the batch pool cannot be
    /// allocated or the poll thread cannot be spawned.
    pub fn spawn<R, C, const N: usize>(
        region: R,
        config: PipelineConfig,
        cache: C,
    ) -> Result<Self, PipelineError>
    where
        R: Deref<Target = DmaRegion<N>> + Send + 'static,
        C: CacheMaintenance + Send + 'static,
    {
        info!(
            capacity = N,
            channels = config.channels,
            slots_per_batch = config.slots_per_batch,
            batch_slots = config.batch_slots,
            cadence = ?config.cadence,
            placement = ?config.placement,
            "pipeline starting"
        );
        config.validate(N)?;

        let metrics = Arc::new(PipelineMetrics::new());
        let handoff = Arc::new(HandoffQueue::new(config.batch_slots));
        let batcher = StagingBatcher::with_pool(&config, Arc::clone(&handoff), Arc::clone(&metrics))
            .map_err(|e| {
                error!(error = %e, "failed to allocate batch pool");
                PipelineError::Alloc(e)
            })?;
        let mut consumer = RingConsumer::new(region, cache, &config, batcher, Arc::clone(&metrics))?;

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown_flag);
        let core = placement::resolve(config.placement);
        let cadence = config.cadence;

        debug!(?core, "spawning poll thread");
        let poll_handle = thread::Builder::new()
            .name("iqstream-poll".into())
            .spawn(move || {
                if let Some(core) = core {
                    if placement::pin_to_core(core) {
                        debug!(core, "poll thread pinned");
                    } else {
                        warn!(core, "failed to pin poll thread");
                    }
                }
                info!(tail = consumer.tail(), "poll thread started");
                run(&mut consumer, &flag, cadence);
                info!(tail = consumer.tail(), "poll thread exiting");
            })
            .map_err(|e| {
                error!(error = %e, "failed to spawn poll thread");
                PipelineError::Spawn(e)
            })?;
        let waker = poll_handle.thread().clone();

        info!("pipeline started");
        Ok(Self {
            shutdown_flag,
            poll_handle: Some(poll_handle),
            waker,
            handoff,
            metrics,
        })
    }

    /// Queue of completed batches.
    #[inline]
    pub fn handoff(&self) -> &Arc<BatchQueue> {
        &self.handoff
    }

    #[inline]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// All counters, including the handoff queue's overflow count.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transport_overflows: self.handoff.overflows(),
            ..self.metrics.snapshot()
        }
    }

    /// The poll thread; unparking it cuts a [`PollCadence::Interval`] wait
    /// short.
    #[must_use]
    pub fn waker(&self) -> Thread {
        self.waker.clone()
    }

    /// A pump feeding `endpoint` from this pipeline's queue. Completions
    /// wake the poll thread.
    pub fn transport<E: BulkEndpoint>(&self, endpoint: E) -> TransportPump<E> {
        TransportPump::new(endpoint, Arc::clone(&self.handoff), Arc::clone(&self.metrics))
            .with_waker(self.waker())
    }

    /// Returns a clone of the shutdown flag for external signal handling.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Stops the poll thread after its current pass and waits for it.
    pub fn shutdown(mut self) {
        info!("pipeline shutdown initiated");
        self.signal();
        if let Some(handle) = self.poll_handle.take() {
            debug!("waiting for poll thread to exit");
            if handle.join().is_err() {
                error!("poll thread panicked");
            }
        }
        info!(metrics = ?self.snapshot(), "pipeline shutdown complete");
    }

    fn signal(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        self.waker.unpark();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.signal();
    }
}

fn run<R, C, const N: usize>(
    consumer: &mut RingConsumer<R, C, N>,
    shutdown: &AtomicBool,
    cadence: PollCadence,
) where
    R: Deref<Target = DmaRegion<N>>,
    C: CacheMaintenance,
{
    while !shutdown.load(Ordering::Relaxed) {
        consumer.poll();
        match cadence {
            PollCadence::Spin => thread::yield_now(),
            PollCadence::Interval(period) => thread::park_timeout(period),
        }
    }
}
