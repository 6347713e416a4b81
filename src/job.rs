//! Immutable per-run job configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{FpError, FpResult};
use crate::fingerprint::{stage_identifier, FingerprintSet, PIPELINE_GENERATION};
use crate::model::IndexMapping;

/// Selection of one pluggable stage: a stable registry code plus a JSON
/// kwargs object handed to the algorithm's constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSelect {
    pub code: String,
    #[serde(default = "empty_kwargs")]
    pub kwargs: Value,
}

fn empty_kwargs() -> Value {
    json!({})
}

impl StageSelect {
    #[must_use]
    pub fn new(code: &str) -> Self {
        Self {
            code: code.to_owned(),
            kwargs: empty_kwargs(),
        }
    }

    #[must_use]
    pub fn with_kwargs(code: &str, kwargs: Value) -> Self {
        Self {
            code: code.to_owned(),
            kwargs,
        }
    }
}

/// How the input dataset is read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataOptions {
    /// Physical pixel size in µm, propagated into the output attributes.
    pub pixel_size: f64,
    /// Optional frame-index remapping applied on read.
    #[serde(default)]
    pub index_mapping: Option<IndexMapping>,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            pixel_size: 0.26,
            index_mapping: None,
        }
    }
}

/// Immutable configuration for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub path_in: PathBuf,
    pub path_out: PathBuf,
    pub data: DataOptions,
    pub background: StageSelect,
    pub segmenter: StageSelect,
    pub extractor: StageSelect,
    pub gate: StageSelect,
    /// Desired worker count for the compute stages.
    pub num_workers: usize,
    /// Forces single-worker, single-slot execution for determinism.
    pub debug: bool,
    /// Copy externally-referenced (basin) data into the output so it is
    /// fully self-contained.
    pub drain_basins: bool,
}

impl PipelineJob {
    /// A job with the built-in default stage selection.
    #[must_use]
    pub fn new(path_in: PathBuf, path_out: PathBuf) -> Self {
        let num_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            path_in,
            path_out,
            data: DataOptions::default(),
            background: StageSelect::new("rollmed"),
            segmenter: StageSelect::new("thresh"),
            extractor: StageSelect::new("moments"),
            gate: StageSelect::new("size"),
            num_workers,
            debug: false,
            drain_basins: false,
        }
    }

    pub fn validate(&self) -> FpResult<()> {
        if self.num_workers == 0 {
            return Err(FpError::InvalidJob("num_workers must be at least 1".to_owned()));
        }
        if self.path_in == self.path_out {
            return Err(FpError::InvalidJob(
                "input and output paths must differ".to_owned(),
            ));
        }
        Ok(())
    }

    /// The six content-addressed identifiers for this job's configuration.
    #[must_use]
    pub fn fingerprints(&self) -> FingerprintSet {
        let mapping = self
            .data
            .index_mapping
            .as_ref()
            .map(|m| m.descriptor())
            .unwrap_or_default();
        let data_kwargs = json!({
            "pixel_size": self.data.pixel_size,
            "index_mapping": mapping,
        });
        FingerprintSet {
            generation: PIPELINE_GENERATION.to_owned(),
            data: stage_identifier("data", &data_kwargs),
            background: stage_identifier(&self.background.code, &self.background.kwargs),
            segmenter: stage_identifier(&self.segmenter.code, &self.segmenter.kwargs),
            feature: stage_identifier(&self.extractor.code, &self.extractor.kwargs),
            gate: stage_identifier(&self.gate.code, &self.gate.kwargs),
        }
    }
}
