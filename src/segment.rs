//! Segmenter manager: the producer side of the slot ring.
//!
//! One coordinating thread feeds frames (background-corrected when the
//! segmenter asks for it) to the pluggable segmenter and publishes each
//! frame's label chunk into the next free slot, blocking when all slots
//! are filled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::algorithm::Segmenter;
use crate::error::{ErrorSlot, FpError};
use crate::logging::LogSender;
use crate::model::Frame;
use crate::slots::SlotRing;
use crate::store::Dataset;

pub struct SegmenterManager {
    handle: JoinHandle<()>,
    segmented: Arc<AtomicUsize>,
}

impl SegmenterManager {
    pub fn spawn(
        segmenter: Box<dyn Segmenter>,
        data: Arc<Dataset>,
        ring: Arc<SlotRing>,
        use_correction: bool,
        errors: ErrorSlot,
        log: LogSender,
    ) -> std::io::Result<Self> {
        let segmented = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&segmented);
        let handle = std::thread::Builder::new()
            .name("segmenter-manager".to_owned())
            .spawn(move || {
                run_loop(&*segmenter, &data, &ring, use_correction, &errors, &log, &counter);
                // Whether we finished or failed, consumers must be woken.
                ring.close();
            })?;
        Ok(Self { handle, segmented })
    }

    #[must_use]
    pub fn segmented_frames(&self) -> usize {
        self.segmented.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

fn run_loop(
    segmenter: &dyn Segmenter,
    data: &Dataset,
    ring: &SlotRing,
    use_correction: bool,
    errors: &ErrorSlot,
    log: &LogSender,
    segmented: &AtomicUsize,
) {
    let total = data.len();
    log.debug(
        "segmentation",
        format!("segmenting {total} frames with `{}`", segmenter.code()),
    );
    for index in 0..total {
        let frame = match load_frame(data, index, use_correction) {
            Ok(frame) => frame,
            Err(error) => {
                errors.set(error);
                return;
            }
        };
        let chunk = match segmenter.segment(&frame) {
            Ok(chunk) => chunk,
            Err(error) => {
                errors.set(FpError::stage("segmentation", error.to_string()));
                return;
            }
        };
        if !ring.publish(chunk) {
            // Ring closed underneath us: the run is tearing down.
            return;
        }
        segmented.fetch_add(1, Ordering::Relaxed);
    }
    log.debug("segmentation", format!("all {total} frames published"));
}

/// Raw frame, or raw minus background when the segmenter wants corrected
/// input.
fn load_frame(data: &Dataset, index: usize, use_correction: bool) -> Result<Frame, FpError> {
    let mut frame = data.frame(index)?;
    if use_correction {
        let background = data.background_frame(index)?;
        for (pixel, bg) in frame.pixels.iter_mut().zip(&background.pixels) {
            *pixel -= bg;
        }
    }
    Ok(frame)
}
