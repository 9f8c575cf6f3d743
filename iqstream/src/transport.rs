//! Submission side: hands completed batches to a bulk endpoint.
//!
//! The endpoint itself (USB gadget, socket, file) is a collaborator behind
//! [`BulkEndpoint`]. [`TransportPump`] drains the handoff queue, submits each
//! batch under a fresh [`RequestHandle`], keeps the buffer until the endpoint
//! reports completion and then returns it to the queue for reuse. It never
//! retries; a failed submission or transfer is counted and the buffer retired.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::Thread;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::{BatchQueue, StagingBatch};
use crate::metrics::{self, PipelineMetrics};
use crate::trace::{debug, trace, warn};

/// Identifies one outstanding submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(u64);

impl RequestHandle {
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// How a submitted transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Ok,
    /// Cancelled (endpoint disabled, cable pulled).
    Aborted,
    /// The host side overran its buffer.
    Overflow,
    /// Fewer bytes moved than submitted.
    Short,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("endpoint is not accepting requests")]
    Unavailable,
    #[error("endpoint request queue is full")]
    Busy,
    #[error("endpoint I/O failed")]
    Io(#[from] std::io::Error),
}

/// A bulk OUT endpoint.
///
/// `submit` queues one transfer of `header` followed by `payload` and returns
/// immediately. The endpoint reports the outcome later through
/// [`TransportPump::on_complete`] with the same handle.
pub trait BulkEndpoint {
    /// # Errors
    /// If the transfer could not be queued. The pump will not retry it.
    fn submit(
        &mut self,
        handle: RequestHandle,
        header: &[u8],
        payload: &[u8],
    ) -> Result<(), SubmitError>;
}

impl<E: BulkEndpoint + ?Sized> BulkEndpoint for &mut E {
    fn submit(
        &mut self,
        handle: RequestHandle,
        header: &[u8],
        payload: &[u8],
    ) -> Result<(), SubmitError> {
        (**self).submit(handle, header, payload)
    }
}

impl<E: BulkEndpoint + ?Sized> BulkEndpoint for Box<E> {
    fn submit(
        &mut self,
        handle: RequestHandle,
        header: &[u8],
        payload: &[u8],
    ) -> Result<(), SubmitError> {
        (**self).submit(handle, header, payload)
    }
}

/// Moves batches from the handoff queue to an endpoint and back.
pub struct TransportPump<E> {
    endpoint: E,
    queue: Arc<BatchQueue>,
    metrics: Arc<PipelineMetrics>,
    active: HashMap<RequestHandle, Box<StagingBatch>>,
    drained: Vec<Box<StagingBatch>>,
    next_handle: u64,
    waker: Option<Thread>,
}

impl<E: BulkEndpoint> TransportPump<E> {
    pub fn new(endpoint: E, queue: Arc<BatchQueue>, metrics: Arc<PipelineMetrics>) -> Self {
        let capacity = queue.capacity();
        Self {
            endpoint,
            queue,
            metrics,
            active: HashMap::with_capacity(capacity),
            drained: Vec::with_capacity(capacity),
            next_handle: 0,
            waker: None,
        }
    }

    /// Unparks `thread` whenever a buffer is returned to the queue.
    #[must_use]
    pub fn with_waker(mut self, thread: Thread) -> Self {
        self.waker = Some(thread);
        self
    }

    #[inline]
    pub const fn endpoint(&self) -> &E {
        &self.endpoint
    }

    #[inline]
    pub fn endpoint_mut(&mut self) -> &mut E {
        &mut self.endpoint
    }

    /// Submissions awaiting completion.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    /// Submits every pending batch, oldest first. Returns how many the
    /// endpoint accepted.
    pub fn pump(&mut self) -> usize {
        if self.queue.pop_range(&mut self.drained) == 0 {
            return 0;
        }

        let mut accepted = 0;
        let mut retired = false;
        for batch in self.drained.drain(..) {
            let handle = RequestHandle(self.next_handle);
            self.next_handle += 1;
            match self
                .endpoint
                .submit(handle, batch.header_bytes(), batch.payload())
            {
                Ok(()) => {
                    trace!(
                        %handle,
                        channel = batch.header().channel_id,
                        rx_sequence = batch.header().rx_sequence,
                        "batch submitted"
                    );
                    metrics::bump(&self.metrics.submissions);
                    self.active.insert(handle, batch);
                    accepted += 1;
                }
                Err(_err) => {
                    warn!(%handle, err = %_err, "batch submission refused");
                    metrics::bump(&self.metrics.submit_errors);
                    self.queue.retire(batch);
                    retired = true;
                }
            }
        }
        if retired {
            self.wake();
        }
        accepted
    }

    /// Completion callback from the endpoint.
    ///
    /// Returns `false` for a handle that is not outstanding.
    pub fn on_complete(&mut self, handle: RequestHandle, status: TransferStatus) -> bool {
        let Some(batch) = self.active.remove(&handle) else {
            warn!(%handle, ?status, "completion for unknown request");
            return false;
        };
        self.metrics.record_completion(status);
        if status != TransferStatus::Ok {
            debug!(
                %handle,
                ?status,
                channel = batch.header().channel_id,
                "transfer did not complete cleanly"
            );
        }
        self.queue.retire(batch);
        self.wake();
        true
    }

    /// Completes every outstanding request with `status`, oldest first.
    ///
    /// For teardown, when the endpoint goes away with transfers queued.
    pub fn abort_all(&mut self, status: TransferStatus) -> usize {
        let mut handles: Vec<_> = self.active.keys().copied().collect();
        handles.sort_unstable();
        for &handle in &handles {
            self.on_complete(handle, status);
        }
        handles.len()
    }

    fn wake(&self) {
        if let Some(thread) = &self.waker {
            thread.unpark();
        }
    }
}

impl<E> std::fmt::Debug for TransportPump<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPump")
            .field("in_flight", &self.active.len())
            .field("next_handle", &self.next_handle)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchHeader, StagingBatcher};
    use crate::config::PipelineConfig;
    use crate::handoff::HandoffQueue;
    use crate::ring::{RingSlot, SLOT_SAMPLES};

    #[derive(Default)]
    struct Recording {
        submitted: Vec<(RequestHandle, BatchHeader, usize)>,
        refuse: bool,
    }

    impl BulkEndpoint for Recording {
        fn submit(
            &mut self,
            handle: RequestHandle,
            header: &[u8],
            payload: &[u8],
        ) -> Result<(), SubmitError> {
            if self.refuse {
                return Err(SubmitError::Busy);
            }
            let header = BatchHeader::decode(header).ok_or(SubmitError::Unavailable)?;
            self.submitted.push((handle, header, payload.len()));
            Ok(())
        }
    }

    fn setup(batches: u32) -> (StagingBatcher, TransportPump<Recording>) {
        let config = PipelineConfig {
            channels: 1,
            slots_per_batch: 1,
            batch_slots: 4,
            ..PipelineConfig::default()
        };
        let metrics = Arc::new(PipelineMetrics::new());
        let queue = Arc::new(HandoffQueue::new(config.batch_slots));
        let mut batcher =
            StagingBatcher::with_pool(&config, Arc::clone(&queue), Arc::clone(&metrics)).unwrap();
        let slot = RingSlot::new();
        for seq in 0..batches {
            slot.produce(0, seq, 0, &[0; SLOT_SAMPLES]);
            batcher.accept(0, &slot, 0);
        }
        (batcher, TransportPump::new(Recording::default(), queue, metrics))
    }

    #[test]
    fn pump_submits_in_fifo_order_and_keeps_buffers_active() {
        let (batcher, mut pump) = setup(3);
        assert_eq!(pump.pump(), 3);
        assert_eq!(pump.in_flight(), 3);
        assert_eq!(batcher.queue().pending(), 0);

        let sequences: Vec<_> = pump
            .endpoint()
            .submitted
            .iter()
            .map(|(_, header, _)| header.adc_sequence)
            .collect();
        assert_eq!(sequences, [0, 1, 2]);
        assert_eq!(pump.endpoint().submitted[0].2, crate::batch::PACKED_SLOT_BYTES);
        assert_eq!(pump.pump(), 0);
    }

    #[test]
    fn completion_returns_buffer_and_counts_status() {
        let (batcher, mut pump) = setup(2);
        pump.pump();
        let retired_before = batcher.queue().retired();
        let (first, ..) = pump.endpoint().submitted[0];
        let (second, ..) = pump.endpoint().submitted[1];

        assert!(pump.on_complete(first, TransferStatus::Ok));
        assert!(pump.on_complete(second, TransferStatus::Short));
        assert!(!pump.on_complete(second, TransferStatus::Ok));

        assert_eq!(batcher.queue().retired(), retired_before + 2);
        let snap = pump.metrics.snapshot();
        assert_eq!(snap.completed_ok, 1);
        assert_eq!(snap.completed_short, 1);
        assert_eq!(snap.submissions, 2);
    }

    #[test]
    fn refused_submission_is_retired_not_retried() {
        let (batcher, mut pump) = setup(2);
        pump.endpoint_mut().refuse = true;
        assert_eq!(pump.pump(), 0);
        assert_eq!(pump.in_flight(), 0);
        assert_eq!(batcher.queue().pending(), 0);
        assert_eq!(pump.metrics.snapshot().submit_errors, 2);
    }

    #[test]
    fn abort_all_drains_active_set() {
        let (_batcher, mut pump) = setup(3);
        pump.pump();
        assert_eq!(pump.abort_all(TransferStatus::Aborted), 3);
        assert_eq!(pump.in_flight(), 0);
        assert_eq!(pump.metrics.snapshot().completed_aborted, 3);
    }

    #[test]
    fn completion_unparks_the_waker() {
        let (_batcher, pump) = setup(1);
        let mut pump = pump.with_waker(std::thread::current());
        pump.pump();
        let (handle, ..) = pump.endpoint().submitted[0];
        pump.on_complete(handle, TransferStatus::Ok);
        // The token is already set, so this returns immediately.
        std::thread::park();
    }
}
