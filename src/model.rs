use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Runner state machine
// ---------------------------------------------------------------------------

/// Lifecycle states of a pipeline job run, in logical order. Transitions are
/// strictly increasing except for [`RunnerState::Error`], which may be
/// entered from anywhere and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Created,
    Init,
    Setup,
    Background,
    Segmentation,
    Cleanup,
    Done,
    Error,
}

impl RunnerState {
    /// Position of this state in the logical run order. Used both to gate
    /// legal transitions and to compute the coarse progress estimate.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Created => 0,
            Self::Init => 1,
            Self::Setup => 2,
            Self::Background => 3,
            Self::Segmentation => 4,
            Self::Cleanup => 5,
            Self::Done => 6,
            Self::Error => 7,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Init => "init",
            Self::Setup => "setup",
            Self::Background => "background",
            Self::Segmentation => "segmentation",
            Self::Cleanup => "cleanup",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot returned by the runner's status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerStatus {
    /// Overall progress in `[0, 1]`, weighted across background,
    /// segmentation+extraction, and cleanup.
    pub progress: f64,
    /// Current segmentation throughput in frames per second.
    pub rate: f64,
    pub state: RunnerState,
}

// ---------------------------------------------------------------------------
// Frames, label chunks, events
// ---------------------------------------------------------------------------

/// One raw measurement image plus its index in acquisition order.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub index: usize,
    pub height: usize,
    pub width: usize,
    /// Row-major pixel values, `height * width` long.
    pub pixels: Vec<f32>,
}

impl Frame {
    #[must_use]
    pub fn pixel(&self, row: usize, col: usize) -> f32 {
        self.pixels[row * self.width + col]
    }
}

/// The labeled-mask output of segmenting one frame. Label `0` is background;
/// object labels run `1..=num_labels`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelChunk {
    pub frame_index: usize,
    pub height: usize,
    pub width: usize,
    /// Row-major label values, `height * width` long.
    pub labels: Vec<u32>,
    pub num_labels: u32,
}

impl LabelChunk {
    /// Pixel count per object label (index 0 corresponds to label 1).
    /// Labels outside `1..=num_labels` are ignored.
    #[must_use]
    pub fn label_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.num_labels as usize];
        for &label in &self.labels {
            if label > 0 && label <= self.num_labels {
                sizes[(label - 1) as usize] += 1;
            }
        }
        sizes
    }
}

/// One extracted object's scalar feature record. Ownership passes from an
/// extraction worker to the collector to the writer; never mutated after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub frame_index: usize,
    pub features: BTreeMap<String, f64>,
}

/// The unit placed on the event queue: all events extracted from one frame.
/// Emitted exactly once per frame, even when no objects were found, so the
/// collector can restore frame-index order.
#[derive(Debug, Clone)]
pub struct FrameEvents {
    pub frame_index: usize,
    pub events: Vec<EventRecord>,
}

// ---------------------------------------------------------------------------
// Hardware residency and index remapping
// ---------------------------------------------------------------------------

/// Where a segmenter's compute lives. Drives the worker-count policy: a
/// GPU-resident segmenter ties up the device driver, so extraction gets the
/// majority of workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareProcessor {
    Cpu,
    Gpu,
}

/// Optional remapping of frame indices applied when reading a dataset.
/// Re-running a pipeline with a mapping is never considered idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMapping {
    /// Keep every n-th frame, starting at 0.
    EveryNth(usize),
    /// Explicit frame index list.
    Indices(Vec<usize>),
}

impl IndexMapping {
    /// Resolve the mapping against a dataset of `len` records.
    #[must_use]
    pub fn resolve(&self, len: usize) -> Vec<usize> {
        match self {
            Self::EveryNth(n) => {
                let step = (*n).max(1);
                (0..len).step_by(step).collect()
            }
            Self::Indices(indices) => {
                indices.iter().copied().filter(|&i| i < len).collect()
            }
        }
    }

    /// Short stable descriptor persisted in the output attributes.
    #[must_use]
    pub fn descriptor(&self) -> String {
        match self {
            Self::EveryNth(n) => format!("every-nth:{n}"),
            Self::Indices(indices) => {
                let joined = indices
                    .iter()
                    .map(|i| i.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                let digest = crate::fingerprint::sha256_hex(joined.as_bytes());
                format!("indices:{}:{}", indices.len(), &digest[..8])
            }
        }
    }
}
