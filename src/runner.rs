//! The pipeline job runner.
//!
//! Owns the run state machine, decides which stages actually execute by
//! comparing content-addressed pipeline identifiers against what produced
//! the input file, supervises the stage threads, and performs crash-safe
//! finalization: attributes and provenance go into a temp output file that
//! is atomically renamed to the declared output path only on full success.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::algorithm;
use crate::collect::{Collector, WRITE_THRESHOLD};
use crate::error::{ErrorSlot, FpError, FpResult};
use crate::extract::ExtractorPool;
use crate::fingerprint::FingerprintSet;
use crate::job::{DataOptions, PipelineJob};
use crate::logging::{LogFunnel, LogSender};
use crate::model::{HardwareProcessor, RunnerState, RunnerStatus};
use crate::segment::SegmenterManager;
use crate::slots::SlotRing;
use crate::store::{Dataset, DatasetWriter};
use crate::writer::WriterThread;

// Persisted pipeline attributes.
pub const ATTR_GENERATION: &str = "pipeline:framepipe generation";
pub const ATTR_DATA: &str = "pipeline:framepipe data";
pub const ATTR_BACKGROUND: &str = "pipeline:framepipe background";
pub const ATTR_SEGMENTER: &str = "pipeline:framepipe segmenter";
pub const ATTR_FEATURE: &str = "pipeline:framepipe feature";
pub const ATTR_GATE: &str = "pipeline:framepipe gate";
pub const ATTR_HASH: &str = "pipeline:framepipe hash";
pub const ATTR_YIELD: &str = "pipeline:framepipe yield";
pub const ATTR_MAPPING: &str = "pipeline:framepipe mapping";

/// Fractional time each processing step takes, for the progress estimate.
const PROGRESS_WEIGHT_BACKGROUND: f64 = 4.0;
const PROGRESS_WEIGHT_SEGMENTATION: f64 = 27.0;
const PROGRESS_WEIGHT_CLEANUP: f64 = 1.0;

const SUPERVISOR_POLL: Duration = Duration::from_millis(500);
const JOIN_RETRIES: usize = 10;
const JOIN_TIMEOUT_COMPUTE: Duration = Duration::from_secs(30);
/// Collector and writer drain queues; give them more headroom.
const JOIN_TIMEOUT_DRAIN: Duration = Duration::from_secs(600);

/// Numeric libraries whose internal threading fights the pipeline's own
/// worker parallelism. Checked at startup, warning only.
const THREAD_ENV_VARS: [&str; 4] = [
    "MKL_NUM_THREADS",
    "OMP_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
    "VECLIB_MAXIMUM_THREADS",
];

// ---------------------------------------------------------------------------
// Redo decision
// ---------------------------------------------------------------------------

/// Pipeline metadata stored by a previous run, as read from the input
/// container. Missing attributes default to values that force a redo.
#[derive(Debug, Clone)]
pub struct StoredPipelineMeta {
    pub identifiers: FingerprintSet,
    pub hash: String,
    pub yield_count: i64,
}

impl StoredPipelineMeta {
    #[must_use]
    pub fn read_from(data: &Dataset) -> Self {
        let attr = |name: &str| data.attr_str(name).unwrap_or_else(|| "0".to_owned());
        Self {
            identifiers: FingerprintSet {
                generation: attr(ATTR_GENERATION),
                data: attr(ATTR_DATA),
                background: attr(ATTR_BACKGROUND),
                segmenter: attr(ATTR_SEGMENTER),
                feature: attr(ATTR_FEATURE),
                gate: attr(ATTR_GATE),
            },
            hash: attr(ATTR_HASH),
            yield_count: data.attr_i64(ATTR_YIELD).unwrap_or(-1),
        }
    }
}

/// Which stages must actually execute. Every condition is an independent
/// OR branch; none shadows another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoDecision {
    pub background: bool,
    pub segmentation: bool,
}

impl RedoDecision {
    /// `record_count` is the input's actual record count;
    /// `mapping_active` whether the input is read through an index
    /// remapping (never idempotent: applying the same remapping pipeline
    /// twice in series selects a different subset each time).
    #[must_use]
    pub fn evaluate(
        stored: &StoredPipelineMeta,
        current: &FingerprintSet,
        record_count: i64,
        mapping_active: bool,
    ) -> Self {
        // Sanity: the stored hash must be reproducible from the stored
        // identifiers (catches files where individual pipeline steps were
        // re-run piecemeal), and the file must hold exactly the events it
        // claims to.
        let sanity = stored.identifiers.pipeline_hash() != stored.hash
            || record_count != stored.yield_count
            || mapping_active;

        let background = stored.identifiers.generation != current.generation
            || stored.identifiers.data != current.data
            || stored.identifiers.background != current.background;

        let segmentation = sanity
            || background
            || stored.identifiers.segmenter != current.segmenter
            || stored.identifiers.feature != current.feature
            || stored.identifiers.gate != current.gate;

        Self {
            background,
            segmentation,
        }
    }
}

// ---------------------------------------------------------------------------
// Bounded joins
// ---------------------------------------------------------------------------

/// Join a stage thread with a bounded wait: `retries` attempts of `timeout`
/// each. Exhausting the budget means the pipeline is stuck (e.g. a
/// deadlocked slot) and is a fatal error naming the stage.
pub fn join_stage(
    handle: JoinHandle<()>,
    name: &str,
    timeout: Duration,
    retries: usize,
    log: &LogSender,
) -> FpResult<()> {
    let poll = Duration::from_millis(25);
    let retries = retries.max(1);
    for attempt in 1..=retries {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if handle.is_finished() {
                return match handle.join() {
                    Ok(()) => {
                        log.debug("runner", format!("joined stage `{name}`"));
                        Ok(())
                    }
                    Err(_) => Err(FpError::stage(name, "stage thread panicked")),
                };
            }
            std::thread::sleep(poll);
        }
        log.info(
            "runner",
            format!("waiting for `{name}` (attempt {attempt}/{retries})"),
        );
    }
    log.error("runner", format!("failed to join stage `{name}`"));
    let waited = timeout.as_secs_f64() * retries as f64;
    Err(FpError::JoinTimeout {
        stage: name.to_owned(),
        waited_s: waited.ceil() as u64,
    })
}

// ---------------------------------------------------------------------------
// Shared status
// ---------------------------------------------------------------------------

struct RunnerShared {
    state: Mutex<RunnerState>,
    total_frames: AtomicUsize,
    background_frames: AtomicUsize,
    /// f64 bit patterns; written by the supervisor, read by status queries.
    segmentation_progress_bits: AtomicU64,
    rate_bits: AtomicU64,
    error_text: Mutex<Option<String>>,
}

impl RunnerShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(RunnerState::Created),
            total_frames: AtomicUsize::new(0),
            background_frames: AtomicUsize::new(0),
            segmentation_progress_bits: AtomicU64::new(0f64.to_bits()),
            rate_bits: AtomicU64::new(0f64.to_bits()),
            error_text: Mutex::new(None),
        }
    }

    fn state(&self) -> RunnerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: RunnerState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        debug_assert!(
            next == RunnerState::Error || next.index() >= state.index(),
            "illegal state transition {} -> {}",
            *state,
            next
        );
        *state = next;
    }

    fn set_segmentation_progress(&self, fraction: f64) {
        self.segmentation_progress_bits
            .store(fraction.to_bits(), Ordering::Relaxed);
    }

    fn set_rate(&self, rate: f64) {
        self.rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    }

    fn set_error(&self, text: String) {
        *self.error_text.lock().unwrap_or_else(|e| e.into_inner()) = Some(text);
    }

    fn error_text(&self) -> Option<String> {
        self.error_text
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn status(&self) -> RunnerStatus {
        let state = self.state();
        let total_weight =
            PROGRESS_WEIGHT_BACKGROUND + PROGRESS_WEIGHT_SEGMENTATION + PROGRESS_WEIGHT_CLEANUP;
        let total_frames = self.total_frames.load(Ordering::Relaxed).max(1) as f64;
        let mut progress = 0.0;

        if state.index() > RunnerState::Background.index() {
            progress += PROGRESS_WEIGHT_BACKGROUND / total_weight;
        } else {
            let done = self.background_frames.load(Ordering::Relaxed) as f64;
            progress += PROGRESS_WEIGHT_BACKGROUND / total_weight * (done / total_frames);
        }

        if state.index() > RunnerState::Segmentation.index() {
            progress += PROGRESS_WEIGHT_SEGMENTATION / total_weight;
        } else {
            let fraction =
                f64::from_bits(self.segmentation_progress_bits.load(Ordering::Relaxed));
            progress += PROGRESS_WEIGHT_SEGMENTATION / total_weight * fraction;
        }

        if state == RunnerState::Done {
            progress = 1.0;
        }

        RunnerStatus {
            progress,
            rate: f64::from_bits(self.rate_bits.load(Ordering::Relaxed)),
            state,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker-count policy
// ---------------------------------------------------------------------------

/// `(slots, extractors, segmenters)` for the segmentation+extraction stage.
fn worker_policy(
    debug: bool,
    hardware: HardwareProcessor,
    num_workers: usize,
) -> (usize, usize, usize) {
    if debug {
        // Deterministic serial execution for testing.
        return (1, 1, 1);
    }
    match hardware {
        HardwareProcessor::Cpu => {
            // Two slots shared between all workers: fewer copies, more
            // software pipelining. Workers split roughly evenly.
            let extractors = (num_workers / 2).max(1);
            let segmenters = num_workers.saturating_sub(extractors).max(1);
            (2, extractors, segmenters)
        }
        HardwareProcessor::Gpu => {
            // Segmentation ties up the device driver; extraction gets the
            // full worker budget and one extra slot hides the latency.
            (3, num_workers.max(1), 1)
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

// ---------------------------------------------------------------------------
// The runner
// ---------------------------------------------------------------------------

pub struct JobRunner {
    job: PipelineJob,
    tmp_suffix: String,
    fingerprints: FingerprintSet,
    pipeline_hash: String,
    event_count: usize,
    shared: Arc<RunnerShared>,
    funnel: LogFunnel,
    log: LogSender,
    path_log: PathBuf,
    data_raw: Option<Arc<Dataset>>,
    data_temp_in: Option<Arc<Dataset>>,
}

impl JobRunner {
    pub fn new(job: PipelineJob) -> FpResult<Self> {
        job.validate()?;
        let fingerprints = job.fingerprints();
        let pipeline_hash = fingerprints.pipeline_hash();
        let tmp_suffix = format!(
            "{}_{}",
            hostname(),
            &uuid::Uuid::new_v4().simple().to_string()[..5]
        );
        let path_log = job.path_out.with_extension("log");
        let funnel = LogFunnel::create(&path_log, job.debug)?;
        let log = funnel.sender();

        for var in THREAD_ENV_VARS {
            if let Ok(value) = std::env::var(var) {
                if value != "1" {
                    log.warn(
                        "runner",
                        format!(
                            "{var}={value}: set it to '1'; the pipeline supplies its own \
                             worker parallelism and nested threading oversubscribes the machine"
                        ),
                    );
                }
            }
        }

        Ok(Self {
            job,
            tmp_suffix,
            fingerprints,
            pipeline_hash,
            event_count: 0,
            shared: Arc::new(RunnerShared::new()),
            funnel,
            log,
            path_log,
            data_raw: None,
            data_temp_in: None,
        })
    }

    #[must_use]
    pub fn job(&self) -> &PipelineJob {
        &self.job
    }

    #[must_use]
    pub fn pipeline_hash(&self) -> &str {
        &self.pipeline_hash
    }

    #[must_use]
    pub fn fingerprints(&self) -> &FingerprintSet {
        &self.fingerprints
    }

    #[must_use]
    pub fn status(&self) -> RunnerStatus {
        self.shared.status()
    }

    /// Background-augmented input: `<stem>_input_bb_<suffix>.<ext>~`.
    #[must_use]
    pub fn path_temp_in(&self) -> PathBuf {
        self.temp_path("input_bb")
    }

    /// In-progress output: `<stem>_output_<suffix>.<ext>~`.
    #[must_use]
    pub fn path_temp_out(&self) -> PathBuf {
        self.temp_path("output")
    }

    #[must_use]
    pub fn path_log(&self) -> &Path {
        &self.path_log
    }

    fn temp_path(&self, tag: &str) -> PathBuf {
        let out = &self.job.path_out;
        let stem = out
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let ext = out.extension().and_then(|s| s.to_str()).unwrap_or("fpz");
        out.with_file_name(format!("{stem}_{tag}_{}.{ext}~", self.tmp_suffix))
    }

    fn canonical_input(&self) -> PathBuf {
        std::fs::canonicalize(&self.job.path_in).unwrap_or_else(|_| self.job.path_in.clone())
    }

    /// Raw input data, opened lazily.
    fn data_raw(&mut self) -> FpResult<Arc<Dataset>> {
        if let Some(data) = &self.data_raw {
            return Ok(Arc::clone(data));
        }
        let data = Arc::new(Dataset::open(&self.job.path_in, &self.job.data)?);
        if data.is_empty() {
            return Err(FpError::dataset(format!(
                "input `{}` has no frames",
                self.job.path_in.display()
            )));
        }
        self.data_raw = Some(Arc::clone(&data));
        Ok(data)
    }

    /// Input with (corrected) background: the basin-backed temp input file,
    /// created on first access.
    fn data_temp_in(&mut self) -> FpResult<Arc<Dataset>> {
        if let Some(data) = &self.data_temp_in {
            return Ok(Arc::clone(data));
        }
        let path = self.path_temp_in();
        if !path.exists() {
            DatasetWriter::create(&path, &[self.canonical_input()])?.close()?;
        }
        let data = Arc::new(Dataset::open(&path, &self.job.data)?);
        self.data_temp_in = Some(Arc::clone(&data));
        Ok(data)
    }

    /// Run synchronously. Temp artifacts and the log file are deleted on
    /// success and preserved for postmortem inspection on error.
    pub fn run(mut self) -> FpResult<()> {
        match self.run_pipeline() {
            Ok(()) => {
                self.close(true);
                Ok(())
            }
            Err(error) => {
                self.shared.set_state(RunnerState::Error);
                self.shared.set_error(error.to_string());
                self.log
                    .error("runner", format!("run failed ({}): {error}", error.error_code()));
                self.close(false);
                Err(error)
            }
        }
    }

    /// Run as a background thread; the returned handle is polled for
    /// status and joined for the final result.
    pub fn spawn(self) -> FpResult<RunnerHandle> {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("job-runner".to_owned())
            .spawn(move || self.run())?;
        Ok(RunnerHandle {
            shared,
            handle: Some(handle),
        })
    }

    fn run_pipeline(&mut self) -> FpResult<()> {
        let started = Instant::now();
        let time_string = chrono::Utc::now().format("%Y-%m-%d-%H.%M.%S").to_string();
        self.shared.set_state(RunnerState::Init);
        self.log.info("runner", format!("run start: {time_string}"));

        if self.job.path_out.exists() {
            return Err(FpError::OutputExists(self.job.path_out.clone()));
        }
        if let Some(parent) = self.job.path_out.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        self.shared.set_state(RunnerState::Setup);
        let data_raw = self.data_raw()?;
        self.shared
            .total_frames
            .store(data_raw.len(), Ordering::Relaxed);

        // If the input file has already been processed by this exact
        // pipeline we do not have to redo everything. The stored hash is
        // compared as well, in case individual steps were re-run piecemeal.
        let stored = StoredPipelineMeta::read_from(&data_raw);
        let redo = RedoDecision::evaluate(
            &stored,
            &self.fingerprints,
            data_raw.len() as i64,
            data_raw.index_mapping_active(),
        );
        self.log.info(
            "runner",
            format!(
                "redo decision: background={}, segmentation={}",
                redo.background, redo.segmentation
            ),
        );
        drop(data_raw);

        self.shared.set_state(RunnerState::Background);
        if redo.background {
            self.task_background()?;
        }

        self.shared.set_state(RunnerState::Segmentation);
        if redo.segmentation {
            self.task_segment_extract()?;
        } else {
            // The previous output is exactly what this pipeline would
            // produce: a basin-backed wrapper around the input suffices,
            // renamed into the temp-output position without recomputation.
            let _ = self.data_temp_in()?;
            self.data_temp_in = None;
            std::fs::rename(self.path_temp_in(), self.path_temp_out())?;
            self.event_count = stored.yield_count.max(0) as usize;
            self.log
                .info("runner", "pipeline unchanged; reusing prior results");
        }

        self.shared.set_state(RunnerState::Cleanup);
        if self.job.drain_basins {
            self.task_drain_basins()?;
        }
        self.finalize(redo, &time_string, started)?;
        self.shared.set_state(RunnerState::Done);
        Ok(())
    }

    /// Populate the temp input file with the derived `image_bg` feature.
    fn task_background(&mut self) -> FpResult<()> {
        self.log.info("runner", "starting background computation");
        // Close the temp input handle so the side file can be rewritten.
        self.data_temp_in = None;
        let data_raw = self.data_raw()?;

        let path = self.path_temp_in();
        let mut dest = if path.exists() {
            DatasetWriter::open_rw(&path)?
        } else {
            DatasetWriter::create(&path, &[self.canonical_input()])?
        };

        let algorithm =
            algorithm::new_background(&self.job.background.code, &self.job.background.kwargs)?;
        self.shared.background_frames.store(0, Ordering::Relaxed);
        algorithm
            .process(
                &data_raw,
                &mut dest,
                self.job.num_workers,
                &self.shared.background_frames,
            )
            .map_err(|e| FpError::stage("background", e.to_string()))?;
        dest.close()?;
        self.log.info("runner", "finished background computation");
        Ok(())
    }

    /// The concurrency core: segmentation feeding extraction through the
    /// slot ring, collector restoring order, writer appending batches.
    fn task_segment_extract(&mut self) -> FpResult<()> {
        self.log
            .info("runner", "starting segmentation and feature extraction");
        let data = self.data_temp_in()?;
        let total = data.len();

        // Probe the segmenter for its residency, then rebuild it with the
        // assigned worker count in its kwargs. Worker counts stay out of
        // the pipeline identifiers: concurrency is not configuration.
        let probe =
            algorithm::new_segmenter(&self.job.segmenter.code, &self.job.segmenter.kwargs)?;
        let (num_slots, num_extractors, num_segmenters) = worker_policy(
            self.job.debug,
            probe.hardware_processor(),
            self.job.num_workers,
        );
        drop(probe);
        let mut seg_kwargs = self.job.segmenter.kwargs.clone();
        if let Some(map) = seg_kwargs.as_object_mut() {
            map.insert("num_workers".to_owned(), json!(num_segmenters));
        }
        let segmenter = algorithm::new_segmenter(&self.job.segmenter.code, &seg_kwargs)?;

        let use_correction = segmenter.requires_background_correction();
        if use_correction && !data.has_feature("image_bg") {
            return Err(FpError::stage(
                "segmentation",
                "segmenter requires background-corrected input but `image_bg` is missing",
            ));
        }
        self.log.debug(
            "runner",
            format!(
                "pipeline topology: {num_slots} slots, {num_segmenters} segmenter workers, \
                 {num_extractors} extractors"
            ),
        );

        let extractor: Arc<dyn algorithm::FeatureExtractor> = Arc::from(algorithm::new_extractor(
            &self.job.extractor.code,
            &self.job.extractor.kwargs,
        )?);
        let gate: Arc<dyn algorithm::Gate> =
            Arc::from(algorithm::new_gate(&self.job.gate.code, &self.job.gate.kwargs)?);

        let ring = Arc::new(SlotRing::new(num_slots));
        let errors = ErrorSlot::new();
        let (event_tx, event_rx) = crossbeam_channel::bounded(1024);
        let (batch_tx, batch_rx) = crossbeam_channel::bounded(16);

        let output = DatasetWriter::create(&self.path_temp_out(), &[self.canonical_input()])?;
        let writer = WriterThread::spawn(output, batch_rx, errors.clone(), self.log.clone())?;
        let manager = SegmenterManager::spawn(
            segmenter,
            Arc::clone(&data),
            Arc::clone(&ring),
            use_correction,
            errors.clone(),
            self.log.clone(),
        )?;
        let pool = ExtractorPool::spawn(
            num_extractors,
            Arc::clone(&data),
            Arc::clone(&ring),
            extractor,
            gate,
            event_tx,
            errors.clone(),
            self.log.clone(),
        )?;
        let collector = Collector::spawn(
            event_rx,
            batch_tx,
            total,
            WRITE_THRESHOLD,
            errors.clone(),
            self.log.clone(),
        )?;

        let (frames_counter, events_counter) = collector.counters();
        let manager_handle = manager.into_handle();
        let collector_handle = collector.into_handle();
        let pool_handles = pool.into_handles();
        let writer_handle = writer.into_handle();

        // Nothing left to do but monitor progress until every frame made
        // it through the collector, or a stage died.
        let t0 = Instant::now();
        let completed = loop {
            if errors.is_set() {
                break false;
            }
            let counted = frames_counter.load(Ordering::Relaxed);
            self.event_count = events_counter.load(Ordering::Relaxed);
            let elapsed = t0.elapsed().as_secs_f64().max(0.03);
            self.shared
                .set_segmentation_progress(counted as f64 / total.max(1) as f64);
            self.shared.set_rate(counted as f64 / elapsed);
            if counted == total {
                break true;
            }
            std::thread::sleep(SUPERVISOR_POLL);
        };
        if !completed {
            // Tear the pipeline down; the joins below double as teardown.
            ring.close();
        }
        self.log.debug("runner", "flushing data to disk");

        // Shut stages down in a fixed order. The collector goes before the
        // extractors: joining the extractors first has deadlocked on busy
        // machines when the event queue was not yet depleted.
        join_stage(
            manager_handle,
            "segmentation",
            JOIN_TIMEOUT_COMPUTE,
            JOIN_RETRIES,
            &self.log,
        )?;
        join_stage(
            collector_handle,
            "collector",
            JOIN_TIMEOUT_DRAIN,
            JOIN_RETRIES,
            &self.log,
        )?;
        for handle in pool_handles {
            join_stage(
                handle,
                "feature extraction",
                JOIN_TIMEOUT_COMPUTE,
                JOIN_RETRIES,
                &self.log,
            )?;
        }
        join_stage(
            writer_handle,
            "writer",
            JOIN_TIMEOUT_DRAIN,
            JOIN_RETRIES,
            &self.log,
        )?;

        self.event_count = events_counter.load(Ordering::Relaxed);
        if let Some(error) = errors.take() {
            return Err(error);
        }
        // Preserve the derived background in the output: a later run that
        // skips the background stage reads `image_bg` from here.
        if data.find_stack("image_bg").is_some() {
            let mut output = DatasetWriter::open_rw(&self.path_temp_out())?;
            output.copy_feature_from(&data, "image_bg");
            output.close()?;
        }
        if self.event_count == 0 {
            // Soft warning: an empty output is still finalized.
            self.log.error(
                "runner",
                format!(
                    "no events found in `{}`; check the input file or revise the pipeline",
                    self.job.path_in.display()
                ),
            );
        }
        self.log
            .info("runner", "finished segmentation and feature extraction");
        Ok(())
    }

    /// Copy every basin feature still missing from the output into the
    /// output, making it fully self-contained.
    fn task_drain_basins(&mut self) -> FpResult<()> {
        let path = self.path_temp_out();
        let source = Dataset::open(&path, &DataOptions::default())?;
        let mut writer = DatasetWriter::open_rw(&path)?;
        for name in source.feature_names() {
            if source.has_local_feature(&name) {
                continue;
            }
            if writer.copy_feature_from(&source, &name) {
                self.log
                    .debug("runner", format!("transferring `{name}` to output file"));
            }
        }
        writer.close()
    }

    /// Write final attributes and provenance, embed the run log, and
    /// atomically rename the finalized temp file into place.
    fn finalize(
        &mut self,
        redo: RedoDecision,
        time_string: &str,
        started: Instant,
    ) -> FpResult<()> {
        let data_raw = self.data_raw()?;
        let mut writer = DatasetWriter::open_rw(&self.path_temp_out())?;

        // Regular metadata from the original file; pipeline attributes are
        // never carried over, they are rewritten below.
        for (key, value) in data_raw.attrs() {
            if !key.starts_with("pipeline:") && writer.attr(key).is_none() {
                writer.set_attr(key, value.clone());
            }
        }
        drop(data_raw);

        writer.set_attr(ATTR_GENERATION, json!(&self.fingerprints.generation));
        writer.set_attr(ATTR_DATA, json!(&self.fingerprints.data));
        writer.set_attr(ATTR_BACKGROUND, json!(&self.fingerprints.background));
        writer.set_attr(ATTR_SEGMENTER, json!(&self.fingerprints.segmenter));
        writer.set_attr(ATTR_FEATURE, json!(&self.fingerprints.feature));
        writer.set_attr(ATTR_GATE, json!(&self.fingerprints.gate));
        writer.set_attr(ATTR_HASH, json!(&self.pipeline_hash));
        writer.set_attr(ATTR_YIELD, json!(self.event_count));
        let mapping_descriptor = self
            .job
            .data
            .index_mapping
            .as_ref()
            .map(|m| m.descriptor())
            .unwrap_or_default();
        writer.set_attr(ATTR_MAPPING, json!(mapping_descriptor));
        writer.set_attr("experiment:event count", json!(self.event_count));
        writer.set_attr("imaging:pixel size", json!(self.job.data.pixel_size));

        if redo.segmentation {
            // Mark the output as a distinct measurement: this file indexes
            // differently than its source, so the source must never pass
            // for a basin of it by accident. Only set when segmentation
            // actually took place.
            let appendix = format!("fp-{}", &self.pipeline_hash[..7]);
            let current = writer
                .attr("experiment:run identifier")
                .and_then(|v| v.as_str())
                .map(str::to_owned);
            let combined = match current {
                Some(existing) if !existing.is_empty() => format!("{existing}_{appendix}"),
                _ => appendix,
            };
            writer.set_attr("experiment:run identifier", json!(combined));
        }

        let provenance = json!({
            "framepipe version": env!("CARGO_PKG_VERSION"),
            "job": &self.job,
            "pipeline": {
                "identifiers": &self.fingerprints,
                "hash": &self.pipeline_hash,
            },
            "system": {
                "os": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "host": hostname(),
            },
            "tasks": {
                "background": redo.background,
                "segmentation": redo.segmentation,
            },
        });
        let lines = serde_json::to_string_pretty(&provenance)?
            .lines()
            .map(str::to_owned)
            .collect();
        writer.store_record(&format!("framepipe-job-{time_string}"), lines);

        let duration = started.elapsed();
        self.log.info(
            "runner",
            format!("run duration: {:.1}s", duration.as_secs_f64()),
        );
        self.log.info(
            "runner",
            format!("run stop: {}", chrono::Utc::now().format("%Y-%m-%d-%H.%M.%S")),
        );
        // Embed the run log; everything sent so far must be on disk first.
        self.funnel.sync();
        if self.path_log.exists() {
            let text = std::fs::read_to_string(&self.path_log)?;
            writer.store_record(
                &format!("framepipe-log-{time_string}"),
                text.trim().lines().map(str::to_owned).collect(),
            );
        }
        writer.close()?;

        // Release handles that may point at the temp files, then rename.
        self.data_raw = None;
        self.data_temp_in = None;
        std::fs::rename(self.path_temp_out(), &self.job.path_out)?;
        Ok(())
    }

    fn close(&mut self, delete_temporary_files: bool) {
        self.data_raw = None;
        self.data_temp_in = None;
        self.funnel.close();
        if delete_temporary_files {
            let _ = std::fs::remove_file(&self.path_log);
            let _ = std::fs::remove_file(self.path_temp_in());
            // The temp output was renamed to the final path on success.
        }
    }
}

/// Handle on a backgrounded runner: poll [`RunnerHandle::status`] while it
/// works, then [`RunnerHandle::join`] for the result.
pub struct RunnerHandle {
    shared: Arc<RunnerShared>,
    handle: Option<JoinHandle<FpResult<()>>>,
}

impl RunnerHandle {
    #[must_use]
    pub fn status(&self) -> RunnerStatus {
        self.shared.status()
    }

    /// Error detail captured by a failed run, for supervisors that poll
    /// instead of joining.
    #[must_use]
    pub fn error_text(&self) -> Option<String> {
        self.shared.error_text()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn join(mut self) -> FpResult<()> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(FpError::stage("runner", "runner thread panicked")),
            },
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::stage_identifier;
    use serde_json::json;

    fn current_set() -> FingerprintSet {
        FingerprintSet {
            generation: "1".to_owned(),
            data: stage_identifier("data", &json!({"pixel_size": 0.26})),
            background: stage_identifier("rollmed", &json!({})),
            segmenter: stage_identifier("thresh", &json!({})),
            feature: stage_identifier("moments", &json!({})),
            gate: stage_identifier("size", &json!({})),
        }
    }

    fn matching_stored(current: &FingerprintSet, yield_count: i64) -> StoredPipelineMeta {
        StoredPipelineMeta {
            identifiers: current.clone(),
            hash: current.pipeline_hash(),
            yield_count,
        }
    }

    #[test]
    fn unprocessed_input_redoes_everything() {
        let current = current_set();
        let stored = StoredPipelineMeta {
            identifiers: FingerprintSet::unset(),
            hash: "0".to_owned(),
            yield_count: -1,
        };
        let redo = RedoDecision::evaluate(&stored, &current, 1000, false);
        assert!(redo.background);
        assert!(redo.segmentation);
    }

    #[test]
    fn matching_pipeline_skips_both_stages() {
        let current = current_set();
        let stored = matching_stored(&current, 1000);
        let redo = RedoDecision::evaluate(&stored, &current, 1000, false);
        assert!(!redo.background);
        assert!(!redo.segmentation);
    }

    #[test]
    fn segmenter_change_redoes_segmentation_only() {
        let current = current_set();
        let mut stored = matching_stored(&current, 1000);
        stored.identifiers.segmenter = stage_identifier("thresh", &json!({"threshold": 2.0}));
        stored.hash = stored.identifiers.pipeline_hash();
        let redo = RedoDecision::evaluate(&stored, &current, 1000, false);
        assert!(!redo.background);
        assert!(redo.segmentation);
    }

    #[test]
    fn tampered_hash_fails_the_sanity_check() {
        let current = current_set();
        let mut stored = matching_stored(&current, 1000);
        stored.hash = "deadbeef".to_owned();
        let redo = RedoDecision::evaluate(&stored, &current, 1000, false);
        assert!(!redo.background);
        assert!(redo.segmentation);
    }

    #[test]
    fn index_mapping_is_never_idempotent() {
        let current = current_set();
        let stored = matching_stored(&current, 1000);
        let redo = RedoDecision::evaluate(&stored, &current, 1000, true);
        assert!(redo.segmentation);
        assert!(!redo.background);
    }

    #[test]
    fn worker_policy_matches_residency() {
        assert_eq!(worker_policy(true, HardwareProcessor::Cpu, 8), (1, 1, 1));
        assert_eq!(worker_policy(true, HardwareProcessor::Gpu, 8), (1, 1, 1));
        assert_eq!(worker_policy(false, HardwareProcessor::Cpu, 8), (2, 4, 4));
        assert_eq!(worker_policy(false, HardwareProcessor::Cpu, 5), (2, 2, 3));
        assert_eq!(worker_policy(false, HardwareProcessor::Cpu, 1), (2, 1, 1));
        assert_eq!(worker_policy(false, HardwareProcessor::Gpu, 8), (3, 8, 1));
    }

    #[test]
    fn temp_paths_carry_the_run_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let job = PipelineJob::new(
            dir.path().join("in.fpz"),
            dir.path().join("out.fpz"),
        );
        let runner = JobRunner::new(job).expect("runner");
        let temp_in = runner.path_temp_in();
        let temp_out = runner.path_temp_out();
        let name_in = temp_in.file_name().and_then(|n| n.to_str()).expect("name");
        let name_out = temp_out.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name_in.starts_with("out_input_bb_"));
        assert!(name_in.ends_with(".fpz~"));
        assert!(name_out.starts_with("out_output_"));
        assert!(name_out.ends_with(".fpz~"));
        // Suffixes are unique per runner, so concurrent runs cannot collide.
        let other = JobRunner::new(PipelineJob::new(
            dir.path().join("in.fpz"),
            dir.path().join("out.fpz"),
        ))
        .expect("runner");
        assert_ne!(runner.path_temp_out(), other.path_temp_out());
    }
}
