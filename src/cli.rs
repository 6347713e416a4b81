use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};

use crate::error::{FpError, FpResult};
use crate::job::{DataOptions, PipelineJob, StageSelect};

#[derive(Debug, Parser)]
#[command(name = "framepipe")]
#[command(about = "Resumable, concurrent pipeline runner for image-frame datasets")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the full pipeline on an input dataset.
    Run(Box<RunArgs>),
    /// Print a dataset's attributes and embedded records.
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Input dataset path.
    pub input: PathBuf,
    /// Output dataset path; must not exist yet.
    pub output: PathBuf,

    /// Background algorithm code.
    #[arg(long, default_value = "rollmed")]
    pub background: String,
    /// Background algorithm kwargs as a JSON object.
    #[arg(long)]
    pub background_kwargs: Option<String>,

    /// Segmenter code.
    #[arg(long, default_value = "thresh")]
    pub segmenter: String,
    /// Segmenter kwargs as a JSON object.
    #[arg(long)]
    pub segmenter_kwargs: Option<String>,

    /// Feature extractor code.
    #[arg(long, default_value = "moments")]
    pub extractor: String,
    /// Feature extractor kwargs as a JSON object.
    #[arg(long)]
    pub extractor_kwargs: Option<String>,

    /// Gate code.
    #[arg(long, default_value = "size")]
    pub gate: String,
    /// Gate kwargs as a JSON object.
    #[arg(long)]
    pub gate_kwargs: Option<String>,

    /// Physical pixel size in µm.
    #[arg(long)]
    pub pixel_size: Option<f64>,

    /// Worker count for the compute stages (defaults to the CPU count).
    #[arg(long)]
    pub num_workers: Option<usize>,

    /// Single-worker deterministic execution (and debug-level run log).
    #[arg(long)]
    pub debug: bool,

    /// Copy externally-referenced (basin) data into the output.
    #[arg(long)]
    pub drain_basins: bool,

    /// Emit a machine-readable JSON summary instead of progress output.
    #[arg(long)]
    pub json: bool,
}

fn parse_kwargs(flag: &str, text: Option<&str>) -> FpResult<Value> {
    let Some(text) = text else {
        return Ok(json!({}));
    };
    let value: Value = serde_json::from_str(text)
        .map_err(|e| FpError::InvalidJob(format!("--{flag}: {e}")))?;
    if !value.is_object() {
        return Err(FpError::InvalidJob(format!(
            "--{flag} must be a JSON object"
        )));
    }
    Ok(value)
}

impl RunArgs {
    pub fn to_job(&self) -> FpResult<PipelineJob> {
        let mut job = PipelineJob::new(self.input.clone(), self.output.clone());
        job.background = StageSelect::with_kwargs(
            &self.background,
            parse_kwargs("background-kwargs", self.background_kwargs.as_deref())?,
        );
        job.segmenter = StageSelect::with_kwargs(
            &self.segmenter,
            parse_kwargs("segmenter-kwargs", self.segmenter_kwargs.as_deref())?,
        );
        job.extractor = StageSelect::with_kwargs(
            &self.extractor,
            parse_kwargs("extractor-kwargs", self.extractor_kwargs.as_deref())?,
        );
        job.gate = StageSelect::with_kwargs(
            &self.gate,
            parse_kwargs("gate-kwargs", self.gate_kwargs.as_deref())?,
        );
        if let Some(pixel_size) = self.pixel_size {
            job.data = DataOptions {
                pixel_size,
                index_mapping: None,
            };
        }
        if let Some(num_workers) = self.num_workers {
            job.num_workers = num_workers;
        }
        job.debug = self.debug;
        job.drain_basins = self.drain_basins;
        job.validate()?;
        Ok(job)
    }
}

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Dataset path.
    pub path: PathBuf,
    /// Emit attributes as JSON.
    #[arg(long)]
    pub json: bool,
}
