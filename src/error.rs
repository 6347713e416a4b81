use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;

pub type FpResult<T> = Result<T, FpError>;

#[derive(Debug, Error)]
pub enum FpError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("output file already exists: `{0}`")]
    OutputExists(PathBuf),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("unknown {stage} algorithm code `{code}`")]
    UnknownAlgorithm { stage: &'static str, code: String },

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("stage `{stage}` failed: {reason}")]
    Stage { stage: String, reason: String },

    #[error("stage `{stage}` did not join within {waited_s}s")]
    JoinTimeout { stage: String, waited_s: u64 },
}

impl FpError {
    pub fn stage(stage: &str, reason: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.to_owned(),
            reason: reason.into(),
        }
    }

    pub fn dataset(reason: impl Into<String>) -> Self {
        Self::Dataset(reason.into())
    }

    /// Stable, unique, machine-readable code for every variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "FP-IO",
            Self::Json(_) => "FP-JSON",
            Self::OutputExists(_) => "FP-OUTPUT-EXISTS",
            Self::Dataset(_) => "FP-DATASET",
            Self::UnknownAlgorithm { .. } => "FP-UNKNOWN-ALGORITHM",
            Self::InvalidJob(_) => "FP-INVALID-JOB",
            Self::Stage { .. } => "FP-STAGE",
            Self::JoinTimeout { .. } => "FP-JOIN-TIMEOUT",
        }
    }
}

/// First-error-wins slot shared between the pipeline stage threads and the
/// supervising runner. A stage that fails records its error here and winds
/// down; the supervisor picks the error up on its next poll tick.
#[derive(Clone, Default)]
pub struct ErrorSlot {
    inner: Arc<Mutex<Option<FpError>>>,
}

impl ErrorSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `error` unless another stage already failed.
    pub fn set(&self, error: FpError) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(error);
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Remove and return the recorded error, if any.
    pub fn take(&self) -> Option<FpError> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl std::fmt::Debug for ErrorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSlot").finish_non_exhaustive()
    }
}
