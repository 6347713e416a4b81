#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};

use framepipe::algorithm::{
    self, FeatureExtractor, Segmenter,
};
use framepipe::error::{FpError, FpResult};
use framepipe::job::{PipelineJob, StageSelect};
use framepipe::model::{EventRecord, Frame, HardwareProcessor, LabelChunk};
use framepipe::store::{DatasetWriter, FrameStack};

/// Write a synthetic input dataset: `count` frames of constant background
/// level 100 with one 3x3 dark blob (value 20) whose column shifts by three
/// pixels per frame. The jump keeps any pixel blob-covered in at most one
/// frame of a five-frame window, so a rolling median recovers the flat
/// background exactly.
pub fn write_blob_input(path: &Path, count: usize) {
    let (height, width) = (8usize, 16usize);
    let mut frames = Vec::with_capacity(count);
    for i in 0..count {
        let mut pixels = vec![100.0f32; height * width];
        let row0 = 2;
        let col0 = 1 + 3 * (i % 5);
        for row in row0..row0 + 3 {
            for col in col0..col0 + 3 {
                pixels[row * width + col] = 20.0;
            }
        }
        frames.push(pixels);
    }
    let mut writer = DatasetWriter::create(path, &[]).expect("create input");
    writer.set_attr("experiment:run identifier", json!("m-0001"));
    writer.set_stack(
        "image",
        FrameStack {
            height,
            width,
            frames,
        },
    );
    writer.close().expect("close input");
}

/// Write `count` featureless constant frames (for tests that install their
/// own trivial segmenter and do not care about image content).
pub fn write_flat_input(path: &Path, count: usize) {
    let (height, width) = (4usize, 4usize);
    let mut writer = DatasetWriter::create(path, &[]).expect("create input");
    writer.set_attr("experiment:run identifier", json!("m-0001"));
    writer.set_stack(
        "image",
        FrameStack {
            height,
            width,
            frames: vec![vec![100.0f32; height * width]; count],
        },
    );
    writer.close().expect("close input");
}

/// A job wired to a small background window and a fixed worker count, so
/// tests run quickly and deterministically.
pub fn test_job(path_in: PathBuf, path_out: PathBuf) -> PipelineJob {
    let mut job = PipelineJob::new(path_in, path_out);
    job.background = StageSelect::with_kwargs("rollmed", json!({"window": 5}));
    job.num_workers = 4;
    job
}

// ---------------------------------------------------------------------------
// Test algorithms, installed through the public registries
// ---------------------------------------------------------------------------

struct WholeFrameSegmenter;

impl Segmenter for WholeFrameSegmenter {
    fn code(&self) -> &'static str {
        "whole-frame"
    }
    fn requires_background_correction(&self) -> bool {
        false
    }
    fn hardware_processor(&self) -> HardwareProcessor {
        HardwareProcessor::Cpu
    }
    fn segment(&self, frame: &Frame) -> FpResult<LabelChunk> {
        Ok(LabelChunk {
            frame_index: frame.index,
            height: frame.height,
            width: frame.width,
            labels: vec![1; frame.pixels.len()],
            num_labels: 1,
        })
    }
}

fn whole_frame_factory(_kwargs: &Value) -> FpResult<Box<dyn Segmenter>> {
    Ok(Box::new(WholeFrameSegmenter))
}

struct ExplodingSegmenter;

impl Segmenter for ExplodingSegmenter {
    fn code(&self) -> &'static str {
        "explode"
    }
    fn requires_background_correction(&self) -> bool {
        false
    }
    fn hardware_processor(&self) -> HardwareProcessor {
        HardwareProcessor::Cpu
    }
    fn segment(&self, _frame: &Frame) -> FpResult<LabelChunk> {
        Err(FpError::stage("segmentation", "synthetic segmenter failure"))
    }
}

fn explode_factory(_kwargs: &Value) -> FpResult<Box<dyn Segmenter>> {
    Ok(Box::new(ExplodingSegmenter))
}

/// One event per mask, carrying only the originating frame index.
struct FrameEchoExtractor {
    /// Sleep this long on even frames, to force out-of-order completion
    /// across concurrent workers.
    stall_even_frames: Duration,
}

impl FeatureExtractor for FrameEchoExtractor {
    fn code(&self) -> &'static str {
        "frame-echo"
    }
    fn extract(
        &self,
        _frame: &Frame,
        chunk: &LabelChunk,
        _label: u32,
    ) -> FpResult<Option<EventRecord>> {
        if !self.stall_even_frames.is_zero() && chunk.frame_index % 2 == 0 {
            std::thread::sleep(self.stall_even_frames);
        }
        let mut features = BTreeMap::new();
        features.insert("index".to_owned(), chunk.frame_index as f64);
        Ok(Some(EventRecord {
            frame_index: chunk.frame_index,
            features,
        }))
    }
}

fn frame_echo_factory(_kwargs: &Value) -> FpResult<Box<dyn FeatureExtractor>> {
    Ok(Box::new(FrameEchoExtractor {
        stall_even_frames: Duration::ZERO,
    }))
}

fn sleepy_echo_factory(kwargs: &Value) -> FpResult<Box<dyn FeatureExtractor>> {
    let stall_ms = kwargs.get("stall_ms").and_then(Value::as_u64).unwrap_or(15);
    Ok(Box::new(FrameEchoExtractor {
        stall_even_frames: Duration::from_millis(stall_ms),
    }))
}

/// Install every test algorithm. Idempotent; each test file calls it up
/// front.
pub fn register_test_algorithms() {
    algorithm::register_segmenter("whole-frame", whole_frame_factory);
    algorithm::register_segmenter("explode", explode_factory);
    algorithm::register_extractor("frame-echo", frame_echo_factory);
    algorithm::register_extractor("sleepy-echo", sleepy_echo_factory);
}

/// Temp artifacts in `dir` left behind by a run (names ending in `~`).
pub fn leftover_temp_files(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with('~'))
        })
        .collect()
}

/// Parse the embedded provenance record (`framepipe-job-...`) of a dataset.
pub fn job_record(data: &framepipe::store::Dataset) -> Value {
    let name = data
        .record_names()
        .into_iter()
        .find(|n| n.starts_with("framepipe-job-"))
        .expect("job record present");
    let text = data.record(&name).expect("record lines").join("\n");
    serde_json::from_str(&text).expect("job record is JSON")
}
