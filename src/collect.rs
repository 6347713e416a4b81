//! Collector: restores frame-index order and batches event records.
//!
//! Extraction workers run concurrently and finish out of order; the
//! collector buffers their per-frame results and releases them strictly in
//! frame order, accumulating a write threshold's worth of records before
//! flushing a batch to the writer. Its counters are what the supervising
//! runner polls for progress and rate reporting.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{ErrorSlot, FpError};
use crate::logging::LogSender;
use crate::model::{EventRecord, FrameEvents};

/// Records accumulated before a batch is handed to the writer.
pub const WRITE_THRESHOLD: usize = 500;

pub struct Collector {
    handle: JoinHandle<()>,
    written_frames: Arc<AtomicUsize>,
    written_events: Arc<AtomicUsize>,
}

impl Collector {
    pub fn spawn(
        event_rx: Receiver<FrameEvents>,
        batch_tx: Sender<Vec<EventRecord>>,
        total_frames: usize,
        write_threshold: usize,
        errors: ErrorSlot,
        log: LogSender,
    ) -> std::io::Result<Self> {
        let written_frames = Arc::new(AtomicUsize::new(0));
        let written_events = Arc::new(AtomicUsize::new(0));
        let frames = Arc::clone(&written_frames);
        let events = Arc::clone(&written_events);
        let handle = std::thread::Builder::new()
            .name("collector".to_owned())
            .spawn(move || {
                run_loop(
                    &event_rx,
                    &batch_tx,
                    total_frames,
                    write_threshold.max(1),
                    &errors,
                    &log,
                    &frames,
                    &events,
                );
            })?;
        Ok(Self {
            handle,
            written_frames,
            written_events,
        })
    }

    /// Frames released in order so far.
    #[must_use]
    pub fn written_frames(&self) -> usize {
        self.written_frames.load(Ordering::Relaxed)
    }

    /// Event records released so far.
    #[must_use]
    pub fn written_events(&self) -> usize {
        self.written_events.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn counters(&self) -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (
            Arc::clone(&self.written_frames),
            Arc::clone(&self.written_events),
        )
    }

    #[must_use]
    pub fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    event_rx: &Receiver<FrameEvents>,
    batch_tx: &Sender<Vec<EventRecord>>,
    total_frames: usize,
    write_threshold: usize,
    errors: &ErrorSlot,
    log: &LogSender,
    written_frames: &AtomicUsize,
    written_events: &AtomicUsize,
) {
    let mut pending: BTreeMap<usize, Vec<EventRecord>> = BTreeMap::new();
    let mut buffer: Vec<EventRecord> = Vec::with_capacity(write_threshold);
    let mut next_frame = 0usize;

    for message in event_rx {
        pending.insert(message.frame_index, message.events);
        // Release everything that is now contiguous from the front.
        while let Some(events) = pending.remove(&next_frame) {
            written_events.fetch_add(events.len(), Ordering::Relaxed);
            buffer.extend(events);
            next_frame += 1;
            written_frames.store(next_frame, Ordering::Relaxed);
        }
        if buffer.len() >= write_threshold {
            let batch = std::mem::take(&mut buffer);
            if batch_tx.send(batch).is_err() {
                return;
            }
        }
    }

    // Senders are gone. A complete run has released every frame; anything
    // else means a stage died mid-stream.
    if next_frame < total_frames && !errors.is_set() {
        errors.set(FpError::stage(
            "collector",
            format!("event stream ended at frame {next_frame} of {total_frames}"),
        ));
    }
    if !buffer.is_empty() {
        let _ = batch_tx.send(buffer);
    }
    log.debug(
        "collector",
        format!(
            "collected {} events over {next_frame} frames",
            written_events.load(Ordering::Relaxed)
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFunnel;
    use crossbeam_channel::bounded;
    use std::collections::BTreeMap as Map;

    fn event(frame_index: usize) -> EventRecord {
        EventRecord {
            frame_index,
            features: Map::new(),
        }
    }

    #[test]
    fn out_of_order_frames_are_released_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut funnel = LogFunnel::create(&dir.path().join("run.log"), false).expect("funnel");
        let (event_tx, event_rx) = bounded(16);
        let (batch_tx, batch_rx) = bounded(16);
        let collector = Collector::spawn(
            event_rx,
            batch_tx,
            4,
            2,
            ErrorSlot::new(),
            funnel.sender(),
        )
        .expect("spawn");

        // Arrival order 2, 0, 3, 1; frames 2 and 3 each carry one event.
        for index in [2usize, 0, 3, 1] {
            let events = if index >= 2 { vec![event(index)] } else { vec![] };
            event_tx
                .send(FrameEvents {
                    frame_index: index,
                    events,
                })
                .expect("send");
        }
        drop(event_tx);

        let mut released: Vec<usize> = Vec::new();
        for batch in batch_rx {
            released.extend(batch.iter().map(|r| r.frame_index));
        }
        assert_eq!(released, vec![2, 3]);

        let handle = collector.into_handle();
        handle.join().expect("join");
        funnel.close();
    }

    #[test]
    fn truncated_stream_reports_collector_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut funnel = LogFunnel::create(&dir.path().join("run.log"), false).expect("funnel");
        let (event_tx, event_rx) = bounded(4);
        let (batch_tx, _batch_rx) = bounded(4);
        let errors = ErrorSlot::new();
        let collector = Collector::spawn(
            event_rx,
            batch_tx,
            10,
            500,
            errors.clone(),
            funnel.sender(),
        )
        .expect("spawn");

        event_tx
            .send(FrameEvents {
                frame_index: 0,
                events: vec![event(0)],
            })
            .expect("send");
        drop(event_tx);
        collector.into_handle().join().expect("join");

        match errors.take() {
            Some(FpError::Stage { stage, reason }) => {
                assert_eq!(stage, "collector");
                assert!(reason.contains("frame 1 of 10"), "got: {reason}");
            }
            other => panic!("unexpected: {other:?}"),
        }
        funnel.close();
    }
}
