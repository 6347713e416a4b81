//! Moment-based feature extraction: area, centroid position, brightness
//! statistics, and bounding box of one labeled object.

use std::collections::BTreeMap;

use serde_json::Value;

use super::FeatureExtractor;
use crate::error::FpResult;
use crate::model::{EventRecord, Frame, LabelChunk};

pub struct MomentsExtractor;

pub(super) fn factory(_kwargs: &Value) -> FpResult<Box<dyn FeatureExtractor>> {
    Ok(Box::new(MomentsExtractor))
}

impl FeatureExtractor for MomentsExtractor {
    fn code(&self) -> &'static str {
        "moments"
    }

    fn extract(
        &self,
        frame: &Frame,
        chunk: &LabelChunk,
        label: u32,
    ) -> FpResult<Option<EventRecord>> {
        let width = chunk.width;
        let mut count = 0usize;
        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut sum_row = 0.0f64;
        let mut sum_col = 0.0f64;
        let (mut min_row, mut max_row) = (usize::MAX, 0usize);
        let (mut min_col, mut max_col) = (usize::MAX, 0usize);

        for (p, &l) in chunk.labels.iter().enumerate() {
            if l != label {
                continue;
            }
            let (row, col) = (p / width, p % width);
            let value = f64::from(frame.pixels[p]);
            count += 1;
            sum += value;
            sum_sq += value * value;
            sum_row += row as f64;
            sum_col += col as f64;
            min_row = min_row.min(row);
            max_row = max_row.max(row);
            min_col = min_col.min(col);
            max_col = max_col.max(col);
        }

        if count == 0 {
            return Ok(None);
        }

        let n = count as f64;
        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);

        let mut features = BTreeMap::new();
        features.insert("area_px".to_owned(), n);
        features.insert("pos_x".to_owned(), sum_col / n);
        features.insert("pos_y".to_owned(), sum_row / n);
        features.insert("bright_avg".to_owned(), mean);
        features.insert("bright_sd".to_owned(), variance.sqrt());
        features.insert("bbox_w".to_owned(), (max_col - min_col + 1) as f64);
        features.insert("bbox_h".to_owned(), (max_row - min_row + 1) as f64);

        Ok(Some(EventRecord {
            frame_index: chunk.frame_index,
            features,
        }))
    }
}
