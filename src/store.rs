//! Dataset container access.
//!
//! The container is a gzip-compressed JSON document: string attributes,
//! named feature columns (per-event scalars and per-frame image stacks), a
//! list of basin paths (externally referenced containers consulted for
//! features not physically present), and named log records. The binary
//! layout is deliberately simple; everything above it goes through the
//! narrow [`Dataset`]/[`DatasetWriter`] contract.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FpError, FpResult};
use crate::job::DataOptions;
use crate::model::{EventRecord, Frame};

/// Guard against basin reference cycles.
const MAX_BASIN_DEPTH: usize = 4;

/// A per-frame image feature: `frames.len()` images of `height * width`
/// row-major pixels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameStack {
    pub height: usize,
    pub width: usize,
    pub frames: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ContainerDoc {
    #[serde(default)]
    attrs: BTreeMap<String, Value>,
    /// Per-event scalar columns. `None` entries are fill values for events
    /// that did not produce the feature.
    #[serde(default)]
    scalars: BTreeMap<String, Vec<Option<f64>>>,
    #[serde(default)]
    stacks: BTreeMap<String, FrameStack>,
    #[serde(default)]
    basins: Vec<PathBuf>,
    #[serde(default)]
    records: BTreeMap<String, Vec<String>>,
}

fn read_container(path: &Path) -> FpResult<ContainerDoc> {
    let file = File::open(path)?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .map_err(|e| FpError::dataset(format!("corrupt container `{}`: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| FpError::dataset(format!("invalid container `{}`: {e}", path.display())))
}

fn write_container(path: &Path, doc: &ContainerDoc) -> FpResult<()> {
    let file = File::create(path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    serde_json::to_writer(&mut encoder, doc)?;
    let mut inner = encoder.finish()?;
    inner.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Read-only view of a container, with basin fallback and optional
/// frame-index remapping.
pub struct Dataset {
    path: PathBuf,
    doc: ContainerDoc,
    basins: Vec<Dataset>,
    mapping: Option<Vec<usize>>,
    pixel_size: f64,
}

impl Dataset {
    pub fn open(path: &Path, opts: &DataOptions) -> FpResult<Self> {
        let mut dataset = Self::open_at_depth(path, 0)?;
        dataset.pixel_size = opts.pixel_size;
        if let Some(mapping) = &opts.index_mapping {
            let len = dataset.unmapped_len();
            dataset.mapping = Some(mapping.resolve(len));
        }
        Ok(dataset)
    }

    fn open_at_depth(path: &Path, depth: usize) -> FpResult<Self> {
        let doc = read_container(path)?;
        let mut basins = Vec::new();
        if depth < MAX_BASIN_DEPTH {
            for basin_path in &doc.basins {
                match Self::open_at_depth(basin_path, depth + 1) {
                    Ok(basin) => basins.push(basin),
                    Err(error) => {
                        // A dangling basin only matters if one of its
                        // features is actually requested later.
                        tracing::warn!(
                            basin = %basin_path.display(),
                            "skipping unreadable basin: {error}"
                        );
                    }
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            doc,
            basins,
            mapping: None,
            pixel_size: 0.0,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn pixel_size(&self) -> f64 {
        self.pixel_size
    }

    #[must_use]
    pub fn attrs(&self) -> &BTreeMap<String, Value> {
        &self.doc.attrs
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.doc.attrs.get(name)
    }

    #[must_use]
    pub fn attr_str(&self, name: &str) -> Option<String> {
        self.attr(name).and_then(|v| v.as_str()).map(str::to_owned)
    }

    #[must_use]
    pub fn attr_i64(&self, name: &str) -> Option<i64> {
        self.attr(name).and_then(Value::as_i64)
    }

    /// Record count before index remapping: the `frame_index` scalar length
    /// when present (a processed file), otherwise the `image` stack length
    /// (a raw acquisition), resolved through basins.
    fn unmapped_len(&self) -> usize {
        if let Some(column) = self.find_scalar("frame_index") {
            return column.len();
        }
        if let Some(stack) = self.find_stack("image") {
            return stack.frames.len();
        }
        0
    }

    /// Record count with the index mapping applied.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.mapping {
            Some(mapping) => mapping.len(),
            None => self.unmapped_len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn index_mapping_active(&self) -> bool {
        self.mapping.is_some()
    }

    fn map_index(&self, index: usize) -> usize {
        match &self.mapping {
            // Out-of-range logical indices surface as out-of-range physical
            // reads in the caller, not as a panic here.
            Some(mapping) => mapping.get(index).copied().unwrap_or(usize::MAX),
            None => index,
        }
    }

    /// Find a stack locally, then in basins (which resolve recursively).
    pub fn find_stack(&self, name: &str) -> Option<&FrameStack> {
        if let Some(stack) = self.doc.stacks.get(name) {
            return Some(stack);
        }
        self.basins.iter().find_map(|b| b.find_stack(name))
    }

    pub fn find_scalar(&self, name: &str) -> Option<&Vec<Option<f64>>> {
        if let Some(column) = self.doc.scalars.get(name) {
            return Some(column);
        }
        self.basins.iter().find_map(|b| b.find_scalar(name))
    }

    #[must_use]
    pub fn has_feature(&self, name: &str) -> bool {
        self.find_stack(name).is_some() || self.find_scalar(name).is_some()
    }

    /// True only when the feature is physically present in this container
    /// (not merely reachable through a basin).
    #[must_use]
    pub fn has_local_feature(&self, name: &str) -> bool {
        self.doc.stacks.contains_key(name) || self.doc.scalars.contains_key(name)
    }

    /// Scalar column with mapping applied; fill values become NaN.
    #[must_use]
    pub fn scalar(&self, name: &str) -> Option<Vec<f64>> {
        let column = self.find_scalar(name)?;
        let fetch = |i: usize| column.get(i).copied().flatten().unwrap_or(f64::NAN);
        let values = match &self.mapping {
            Some(mapping) => mapping.iter().map(|&i| fetch(i)).collect(),
            None => (0..column.len()).map(fetch).collect(),
        };
        Some(values)
    }

    fn stack_frame(&self, name: &str, index: usize) -> FpResult<Frame> {
        let actual = self.map_index(index);
        let stack = self
            .find_stack(name)
            .ok_or_else(|| FpError::dataset(format!("missing `{name}` feature")))?;
        let pixels = stack.frames.get(actual).ok_or_else(|| {
            FpError::dataset(format!(
                "frame {actual} out of range for `{name}` ({} frames)",
                stack.frames.len()
            ))
        })?;
        Ok(Frame {
            index,
            height: stack.height,
            width: stack.width,
            pixels: pixels.clone(),
        })
    }

    /// Raw image for logical frame `index`.
    pub fn frame(&self, index: usize) -> FpResult<Frame> {
        self.stack_frame("image", index)
    }

    /// Derived background image for logical frame `index`.
    pub fn background_frame(&self, index: usize) -> FpResult<Frame> {
        self.stack_frame("image_bg", index)
    }

    /// All feature names reachable from this container, basins included.
    #[must_use]
    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .doc
            .stacks
            .keys()
            .chain(self.doc.scalars.keys())
            .cloned()
            .collect();
        for basin in &self.basins {
            names.extend(basin.feature_names());
        }
        names.sort();
        names.dedup();
        names
    }

    #[must_use]
    pub fn basin_paths(&self) -> &[PathBuf] {
        &self.doc.basins
    }

    #[must_use]
    pub fn record_names(&self) -> Vec<String> {
        self.doc.records.keys().cloned().collect()
    }

    #[must_use]
    pub fn record(&self, name: &str) -> Option<&[String]> {
        self.doc.records.get(name).map(Vec::as_slice)
    }
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("path", &self.path)
            .field("len", &self.len())
            .field("basins", &self.doc.basins.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Mutable handle on a container file. All changes live in memory until
/// [`DatasetWriter::flush`]; the runner's final atomic rename provides the
/// all-or-nothing guarantee for the declared output path.
pub struct DatasetWriter {
    path: PathBuf,
    doc: ContainerDoc,
}

impl DatasetWriter {
    /// Create a fresh container at `path` referencing `basins`.
    pub fn create(path: &Path, basins: &[PathBuf]) -> FpResult<Self> {
        let doc = ContainerDoc {
            basins: basins.to_vec(),
            ..ContainerDoc::default()
        };
        let writer = Self {
            path: path.to_path_buf(),
            doc,
        };
        writer.flush()?;
        Ok(writer)
    }

    /// Open an existing container for attribute/record updates.
    pub fn open_rw(path: &Path) -> FpResult<Self> {
        let doc = read_container(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_attr(&mut self, name: &str, value: Value) {
        self.doc.attrs.insert(name.to_owned(), value);
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.doc.attrs.get(name)
    }

    #[must_use]
    pub fn has_local_feature(&self, name: &str) -> bool {
        self.doc.stacks.contains_key(name) || self.doc.scalars.contains_key(name)
    }

    /// Number of events appended so far.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.doc
            .scalars
            .get("frame_index")
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn set_stack(&mut self, name: &str, stack: FrameStack) {
        self.doc.stacks.insert(name.to_owned(), stack);
    }

    /// Append a batch of event records, extending every known scalar column
    /// by one entry per event. Features absent from a record get a fill
    /// value; features first seen mid-stream are backfilled.
    pub fn append_events(&mut self, batch: &[EventRecord]) {
        for record in batch {
            let len = self.event_count();
            for name in record.features.keys() {
                self.doc
                    .scalars
                    .entry(name.clone())
                    .or_insert_with(|| vec![None; len]);
            }
            self.doc
                .scalars
                .entry("frame_index".to_owned())
                .or_insert_with(|| vec![None; len]);
            for (name, column) in &mut self.doc.scalars {
                let value = if name == "frame_index" {
                    Some(record.frame_index as f64)
                } else {
                    record.features.get(name).copied()
                };
                column.push(value);
            }
        }
    }

    pub fn store_record(&mut self, name: &str, lines: Vec<String>) {
        self.doc.records.insert(name.to_owned(), lines);
    }

    /// Copy one feature from `source` (basins included) into this
    /// container. Returns `false` when the source does not have it.
    pub fn copy_feature_from(&mut self, source: &Dataset, name: &str) -> bool {
        if let Some(stack) = source.find_stack(name) {
            self.doc.stacks.insert(name.to_owned(), stack.clone());
            return true;
        }
        if let Some(column) = source.find_scalar(name) {
            self.doc.scalars.insert(name.to_owned(), column.clone());
            return true;
        }
        false
    }

    pub fn flush(&self) -> FpResult<()> {
        write_container(&self.path, &self.doc)
    }

    pub fn close(self) -> FpResult<()> {
        self.flush()
    }
}

impl std::fmt::Debug for DatasetWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatasetWriter")
            .field("path", &self.path)
            .field("events", &self.event_count())
            .finish_non_exhaustive()
    }
}
