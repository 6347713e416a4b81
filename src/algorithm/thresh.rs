//! Fixed-threshold segmentation.
//!
//! Works on background-corrected input: a pixel belongs to an object when
//! its corrected value drops below `-threshold` (objects image darker than
//! the background). Connected pixels (4-neighborhood) form one label.

use std::collections::VecDeque;

use serde_json::Value;

use super::{kwarg_f64, Segmenter};
use crate::error::FpResult;
use crate::model::{Frame, HardwareProcessor, LabelChunk};

const DEFAULT_THRESHOLD: f64 = 6.0;

pub struct ThresholdSegmenter {
    threshold: f32,
}

pub(super) fn factory(kwargs: &Value) -> FpResult<Box<dyn Segmenter>> {
    let threshold = kwarg_f64(kwargs, "threshold", DEFAULT_THRESHOLD) as f32;
    Ok(Box::new(ThresholdSegmenter { threshold }))
}

impl Segmenter for ThresholdSegmenter {
    fn code(&self) -> &'static str {
        "thresh"
    }

    fn requires_background_correction(&self) -> bool {
        true
    }

    fn hardware_processor(&self) -> HardwareProcessor {
        HardwareProcessor::Cpu
    }

    fn segment(&self, frame: &Frame) -> FpResult<LabelChunk> {
        let (height, width) = (frame.height, frame.width);
        let mut labels = vec![0u32; height * width];
        let mut next_label = 0u32;
        let mut queue = VecDeque::new();

        let foreground = |p: usize| frame.pixels[p] < -self.threshold;

        for start in 0..labels.len() {
            if labels[start] != 0 || !foreground(start) {
                continue;
            }
            next_label += 1;
            labels[start] = next_label;
            queue.push_back(start);
            while let Some(p) = queue.pop_front() {
                let (row, col) = (p / width, p % width);
                let mut visit = |q: usize| {
                    if labels[q] == 0 && foreground(q) {
                        labels[q] = next_label;
                        queue.push_back(q);
                    }
                };
                if row > 0 {
                    visit(p - width);
                }
                if row + 1 < height {
                    visit(p + width);
                }
                if col > 0 {
                    visit(p - 1);
                }
                if col + 1 < width {
                    visit(p + 1);
                }
            }
        }

        Ok(LabelChunk {
            frame_index: frame.index,
            height,
            width,
            labels,
            num_labels: next_label,
        })
    }
}
