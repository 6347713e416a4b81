//! Feature extraction manager: the consumer side of the slot ring.
//!
//! A pool of worker threads claims filled slots, runs the gate predicate
//! and the pluggable extractor against the raw frame plus label chunk, and
//! emits the frame's events onto the shared result queue. Exactly one
//! [`FrameEvents`] message goes out per claimed frame (empty frames
//! included) so the collector can restore frame order downstream.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use crate::algorithm::{FeatureExtractor, Gate};
use crate::error::{ErrorSlot, FpError, FpResult};
use crate::logging::LogSender;
use crate::model::{EventRecord, FrameEvents, LabelChunk};
use crate::slots::SlotRing;
use crate::store::Dataset;

pub struct ExtractorPool {
    handles: Vec<JoinHandle<()>>,
}

impl ExtractorPool {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        num_workers: usize,
        data: Arc<Dataset>,
        ring: Arc<SlotRing>,
        extractor: Arc<dyn FeatureExtractor>,
        gate: Arc<dyn Gate>,
        event_tx: Sender<FrameEvents>,
        errors: ErrorSlot,
        log: LogSender,
    ) -> std::io::Result<Self> {
        let mut handles = Vec::with_capacity(num_workers);
        for worker in 0..num_workers.max(1) {
            let data = Arc::clone(&data);
            let ring = Arc::clone(&ring);
            let extractor = Arc::clone(&extractor);
            let gate = Arc::clone(&gate);
            let event_tx = event_tx.clone();
            let errors = errors.clone();
            let log = log.clone();
            let handle = std::thread::Builder::new()
                .name(format!("extractor-{worker}"))
                .spawn(move || {
                    worker_loop(&data, &ring, &*extractor, &*gate, &event_tx, &errors, &log);
                })?;
            handles.push(handle);
        }
        // The workers hold their own clones; dropping the original lets the
        // collector observe disconnection once every worker exits.
        drop(event_tx);
        Ok(Self { handles })
    }

    #[must_use]
    pub fn into_handles(self) -> Vec<JoinHandle<()>> {
        self.handles
    }
}

fn worker_loop(
    data: &Dataset,
    ring: &SlotRing,
    extractor: &dyn FeatureExtractor,
    gate: &dyn Gate,
    event_tx: &Sender<FrameEvents>,
    errors: &ErrorSlot,
    log: &LogSender,
) {
    while let Some((slot, chunk)) = ring.claim() {
        match extract_frame(data, extractor, gate, &chunk) {
            Ok(events) => {
                let message = FrameEvents {
                    frame_index: chunk.frame_index,
                    events,
                };
                if event_tx.send(message).is_err() {
                    // Collector is gone; the run is tearing down.
                    ring.release(slot);
                    return;
                }
                ring.release(slot);
            }
            Err(error) => {
                log.error(
                    "extraction",
                    format!("frame {} failed: {error}", chunk.frame_index),
                );
                errors.set(error);
                ring.release(slot);
                return;
            }
        }
    }
}

fn extract_frame(
    data: &Dataset,
    extractor: &dyn FeatureExtractor,
    gate: &dyn Gate,
    chunk: &LabelChunk,
) -> FpResult<Vec<EventRecord>> {
    let frame = data.frame(chunk.frame_index)?;
    let sizes = chunk.label_sizes();
    let mut events = Vec::new();
    for label in 1..=chunk.num_labels {
        let size = sizes[(label - 1) as usize];
        if !gate.admit(size) {
            continue;
        }
        let extracted = extractor
            .extract(&frame, chunk, label)
            .map_err(|e| FpError::stage("feature extraction", e.to_string()))?;
        if let Some(record) = extracted {
            events.push(record);
        }
    }
    Ok(events)
}
