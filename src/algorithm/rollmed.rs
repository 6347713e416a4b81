//! Rolling-median background estimation.
//!
//! For every frame, the background image is the per-pixel median over a
//! window of neighboring frames. Median filtering is robust against the
//! transient objects the later stages are meant to detect, so the derived
//! background converges on the static scene.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;

use super::{kwarg_usize, BackgroundAlgorithm};
use crate::error::{FpError, FpResult};
use crate::store::{Dataset, DatasetWriter, FrameStack};

const DEFAULT_WINDOW: usize = 100;

pub struct RollingMedianBackground {
    window: usize,
}

pub(super) fn factory(kwargs: &Value) -> FpResult<Box<dyn BackgroundAlgorithm>> {
    let window = kwarg_usize(kwargs, "window", DEFAULT_WINDOW);
    if window == 0 {
        return Err(FpError::InvalidJob(
            "rollmed window must be at least 1".to_owned(),
        ));
    }
    Ok(Box::new(RollingMedianBackground { window }))
}

fn median(values: &mut [f32]) -> f32 {
    let mid = values.len() / 2;
    let (_, pivot, _) =
        values.select_nth_unstable_by(mid, |a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    *pivot
}

impl BackgroundAlgorithm for RollingMedianBackground {
    fn code(&self) -> &'static str {
        "rollmed"
    }

    fn process(
        &self,
        input: &Dataset,
        dest: &mut DatasetWriter,
        num_workers: usize,
        progress: &AtomicUsize,
    ) -> FpResult<()> {
        let count = input.len();
        if count == 0 {
            return Err(FpError::dataset("cannot estimate background of empty input"));
        }
        let first = input.frame(0)?;
        let (height, width) = (first.height, first.width);
        let pixels_per_frame = height * width;

        // The window scan revisits frames constantly, so cache all pixel
        // data up front instead of re-reading through the container.
        let frames: Vec<Vec<f32>> = (0..count)
            .map(|i| input.frame(i).map(|f| f.pixels))
            .collect::<FpResult<_>>()?;

        let window = self.window;
        let workers = num_workers.clamp(1, count);
        let chunk_size = count.div_ceil(workers);
        let mut backgrounds: Vec<Vec<f32>> = vec![Vec::new(); count];

        std::thread::scope(|scope| {
            for (chunk_index, chunk) in backgrounds.chunks_mut(chunk_size).enumerate() {
                let frames = &frames;
                scope.spawn(move || {
                    let offset = chunk_index * chunk_size;
                    let mut buffer: Vec<f32> = Vec::with_capacity(window + 1);
                    for (k, out) in chunk.iter_mut().enumerate() {
                        let i = offset + k;
                        let lo = i.saturating_sub(window / 2);
                        let hi = (i + window / 2 + 1).min(count);
                        let mut background = vec![0f32; pixels_per_frame];
                        for (p, value) in background.iter_mut().enumerate() {
                            buffer.clear();
                            buffer.extend(frames[lo..hi].iter().map(|f| f[p]));
                            *value = median(&mut buffer);
                        }
                        *out = background;
                        progress.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        dest.set_stack(
            "image_bg",
            FrameStack {
                height,
                width,
                frames: backgrounds,
            },
        );
        dest.flush()
    }
}
