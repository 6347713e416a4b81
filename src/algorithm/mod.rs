//! Pluggable stage algorithms.
//!
//! Each stage (background estimation, segmentation, feature extraction,
//! gating) is a trait behind a registry that maps a stable string code to a
//! constructor taking JSON kwargs. Registries accept additional
//! registrations at runtime, which is also how tests install fakes.

mod moments;
mod rollmed;
mod size_gate;
mod thresh;

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Mutex, OnceLock};

use serde_json::Value;

use crate::error::{FpError, FpResult};
use crate::model::{EventRecord, Frame, HardwareProcessor, LabelChunk};
use crate::store::{Dataset, DatasetWriter};

pub use moments::MomentsExtractor;
pub use rollmed::RollingMedianBackground;
pub use size_gate::SizeGate;
pub use thresh::ThresholdSegmenter;

// ---------------------------------------------------------------------------
// Stage contracts
// ---------------------------------------------------------------------------

/// Background estimation: derive a per-frame `image_bg` feature from the
/// input dataset and write it into the destination side file.
pub trait BackgroundAlgorithm: Send {
    fn code(&self) -> &'static str;

    /// Process the whole input, bumping `progress` once per finished frame
    /// so the runner can report status while this runs.
    fn process(
        &self,
        input: &Dataset,
        dest: &mut DatasetWriter,
        num_workers: usize,
        progress: &AtomicUsize,
    ) -> FpResult<()>;
}

/// Per-frame labeling. A segmenter may be internally parallel; the manager
/// passes the assigned worker count through the `num_workers` kwarg.
pub trait Segmenter: Send {
    fn code(&self) -> &'static str;

    /// Whether [`Segmenter::segment`] expects background-corrected input.
    fn requires_background_correction(&self) -> bool;

    /// Where the segmenter's compute lives; drives the worker-count policy.
    fn hardware_processor(&self) -> HardwareProcessor;

    fn segment(&self, frame: &Frame) -> FpResult<LabelChunk>;
}

/// Per-object feature extraction against the raw frame plus label chunk.
pub trait FeatureExtractor: Send + Sync {
    fn code(&self) -> &'static str;

    /// Extract one labeled object's features. `None` means the candidate
    /// produced no usable record (e.g. an empty mask).
    fn extract(
        &self,
        frame: &Frame,
        chunk: &LabelChunk,
        label: u32,
    ) -> FpResult<Option<EventRecord>>;
}

/// Candidate filter applied before feature extraction to avoid wasted work.
pub trait Gate: Send + Sync {
    fn code(&self) -> &'static str;

    fn admit(&self, mask_size_px: usize) -> bool;
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

pub type BackgroundFactory = fn(&Value) -> FpResult<Box<dyn BackgroundAlgorithm>>;
pub type SegmenterFactory = fn(&Value) -> FpResult<Box<dyn Segmenter>>;
pub type ExtractorFactory = fn(&Value) -> FpResult<Box<dyn FeatureExtractor>>;
pub type GateFactory = fn(&Value) -> FpResult<Box<dyn Gate>>;

fn background_registry() -> &'static Mutex<HashMap<String, BackgroundFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, BackgroundFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, BackgroundFactory> = HashMap::new();
        map.insert("rollmed".to_owned(), rollmed::factory);
        Mutex::new(map)
    })
}

fn segmenter_registry() -> &'static Mutex<HashMap<String, SegmenterFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, SegmenterFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, SegmenterFactory> = HashMap::new();
        map.insert("thresh".to_owned(), thresh::factory);
        Mutex::new(map)
    })
}

fn extractor_registry() -> &'static Mutex<HashMap<String, ExtractorFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, ExtractorFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, ExtractorFactory> = HashMap::new();
        map.insert("moments".to_owned(), moments::factory);
        Mutex::new(map)
    })
}

fn gate_registry() -> &'static Mutex<HashMap<String, GateFactory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, GateFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, GateFactory> = HashMap::new();
        map.insert("size".to_owned(), size_gate::factory);
        Mutex::new(map)
    })
}

pub fn register_background(code: &str, factory: BackgroundFactory) {
    background_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(code.to_owned(), factory);
}

pub fn register_segmenter(code: &str, factory: SegmenterFactory) {
    segmenter_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(code.to_owned(), factory);
}

pub fn register_extractor(code: &str, factory: ExtractorFactory) {
    extractor_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(code.to_owned(), factory);
}

pub fn register_gate(code: &str, factory: GateFactory) {
    gate_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(code.to_owned(), factory);
}

pub fn new_background(code: &str, kwargs: &Value) -> FpResult<Box<dyn BackgroundAlgorithm>> {
    let factory = background_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(code)
        .copied()
        .ok_or_else(|| FpError::UnknownAlgorithm {
            stage: "background",
            code: code.to_owned(),
        })?;
    factory(kwargs)
}

pub fn new_segmenter(code: &str, kwargs: &Value) -> FpResult<Box<dyn Segmenter>> {
    let factory = segmenter_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(code)
        .copied()
        .ok_or_else(|| FpError::UnknownAlgorithm {
            stage: "segmenter",
            code: code.to_owned(),
        })?;
    factory(kwargs)
}

pub fn new_extractor(code: &str, kwargs: &Value) -> FpResult<Box<dyn FeatureExtractor>> {
    let factory = extractor_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(code)
        .copied()
        .ok_or_else(|| FpError::UnknownAlgorithm {
            stage: "feature",
            code: code.to_owned(),
        })?;
    factory(kwargs)
}

pub fn new_gate(code: &str, kwargs: &Value) -> FpResult<Box<dyn Gate>> {
    let factory = gate_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(code)
        .copied()
        .ok_or_else(|| FpError::UnknownAlgorithm {
            stage: "gate",
            code: code.to_owned(),
        })?;
    factory(kwargs)
}

// ---------------------------------------------------------------------------
// Kwargs helpers shared by the built-ins
// ---------------------------------------------------------------------------

pub(crate) fn kwarg_f64(kwargs: &Value, key: &str, default: f64) -> f64 {
    kwargs.get(key).and_then(Value::as_f64).unwrap_or(default)
}

pub(crate) fn kwarg_usize(kwargs: &Value, key: &str, default: usize) -> usize {
    kwargs
        .get(key)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
        .unwrap_or(default)
}
