//! Inference source boundary
//!
//! The captioning model is an external collaborator. Each forward pass yields
//! a [`BatchOutputs`] whose arrays are consumed read-only. Leading dimensions
//! are either `batch` (per image) or `batch * beam` (per beam row, beam rows
//! of one image are contiguous).

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by an inference source
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Malformed batch dump {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },

    #[error("No batch dumps found in {0}")]
    NoBatches(String),

    #[error("Shape mismatch in '{output}': {detail}")]
    ShapeMismatch { output: String, detail: String },
}

/// Box rows the captioner places ahead of the first detected region
///
/// Row 0 of each image's box block is a whole-image slot, so attention
/// weight `i` belongs to box row `i + 1`.
pub const CAPTIONER_BOX_OFFSET: usize = 1;

/// Named outputs of one forward batch
#[derive(Debug, Clone)]
pub struct BatchOutputs {
    /// Declared region count per image `[batch]`
    pub num_boxes: Array1<usize>,
    /// Region boxes per image `[batch, box_rows, 4]` as left, top, right, bottom
    pub boxes: Array3<f32>,
    /// Box row holding region 0; regions occupy `box_offset..box_offset + num_boxes`
    pub box_offset: usize,
    /// Image identifier per image `[batch]` or per beam row `[batch * beam]`
    pub image_ids: Vec<String>,
    /// Attention weights per step, each `[batch * beam, >= num_boxes]`
    pub attention: Vec<Array2<f32>>,
    /// Partial-token buffers per step, each `[batch * beam, max_len]`
    pub partial_tokens: Vec<Array2<f32>>,
    /// Final beam token sequences `[batch * beam, max_len]`
    pub final_tokens: Array2<f32>,
}

fn shape_error(output: &str, detail: String) -> InferenceError {
    InferenceError::ShapeMismatch {
        output: output.to_string(),
        detail,
    }
}

impl BatchOutputs {
    /// Check every leading dimension against the expected batch layout
    pub fn validate(&self, batch_size: usize, beam_size: usize) -> Result<(), InferenceError> {
        let rows = batch_size * beam_size;

        if self.num_boxes.len() != batch_size {
            return Err(shape_error(
                "num_boxes",
                format!("expected {batch_size} entries, got {}", self.num_boxes.len()),
            ));
        }

        let (box_batch, box_rows, coords) = self.boxes.dim();
        if box_batch != batch_size || coords < 4 {
            return Err(shape_error(
                "boxes",
                format!(
                    "expected [{batch_size}, _, 4], got {:?}",
                    self.boxes.shape()
                ),
            ));
        }

        if let Some((idx, &n)) = self
            .num_boxes
            .iter()
            .enumerate()
            .find(|(_, &n)| n + self.box_offset > box_rows)
        {
            return Err(shape_error(
                "num_boxes",
                format!(
                    "image slot {idx} declares {n} regions after offset {}, box block holds {box_rows}",
                    self.box_offset
                ),
            ));
        }
        let max_regions = self.num_boxes.iter().copied().max().unwrap_or(0);

        if self.image_ids.len() != batch_size && self.image_ids.len() != rows {
            return Err(shape_error(
                "image_id",
                format!(
                    "expected {batch_size} or {rows} entries, got {}",
                    self.image_ids.len()
                ),
            ));
        }

        if self.final_tokens.nrows() != rows {
            return Err(shape_error(
                "caption",
                format!("expected {rows} rows, got {}", self.final_tokens.nrows()),
            ));
        }

        for (step, att) in self.attention.iter().enumerate() {
            if att.nrows() != rows || att.ncols() < max_regions {
                return Err(shape_error(
                    &format!("att_weight_{step}"),
                    format!(
                        "expected [{rows}, >={max_regions}], got {:?}",
                        att.shape()
                    ),
                ));
            }
        }

        for (step, tokens) in self.partial_tokens.iter().enumerate() {
            if tokens.nrows() != rows {
                return Err(shape_error(
                    &format!("bs_sentence_{step}"),
                    format!("expected {rows} rows, got {}", tokens.nrows()),
                ));
            }
        }

        Ok(())
    }

    /// Number of decoding steps for which both attention and tokens exist
    #[must_use]
    pub fn num_steps(&self) -> usize {
        self.attention.len().min(self.partial_tokens.len())
    }

    /// Identifier of each image slot, taken from row 0 of its beam block
    #[must_use]
    pub fn primary_image_ids(&self, batch_size: usize, beam_size: usize) -> Vec<&str> {
        let stride = if self.image_ids.len() == batch_size * beam_size && beam_size > 1 {
            beam_size
        } else {
            1
        };
        (0..batch_size)
            .filter_map(|n| self.image_ids.get(n * stride))
            .map(String::as_str)
            .collect()
    }

    /// Per-step view of `beam_size` attention rows starting at `first_row`
    #[must_use]
    pub fn attention_block(
        &self,
        step: usize,
        first_row: usize,
        beam_size: usize,
    ) -> Option<ArrayView2<'_, f32>> {
        let att = self.attention.get(step)?;
        (first_row + beam_size <= att.nrows())
            .then(|| att.slice(ndarray::s![first_row..first_row + beam_size, ..]))
    }

    /// Per-step view of `beam_size` partial-token rows starting at `first_row`
    #[must_use]
    pub fn token_block(
        &self,
        step: usize,
        first_row: usize,
        beam_size: usize,
    ) -> Option<ArrayView2<'_, f32>> {
        let tokens = self.partial_tokens.get(step)?;
        (first_row + beam_size <= tokens.nrows())
            .then(|| tokens.slice(ndarray::s![first_row..first_row + beam_size, ..]))
    }

    /// Final token sequence of one beam row
    #[must_use]
    pub fn final_row(&self, row: usize) -> Option<ArrayView1<'_, f32>> {
        (row < self.final_tokens.nrows()).then(|| self.final_tokens.row(row))
    }
}

/// Producer of forward batches
///
/// Issued strictly one batch at a time. `Ok(None)` means the source has no
/// more data.
pub trait InferenceSource {
    fn forward(&mut self) -> Result<Option<BatchOutputs>, InferenceError>;
}

/// In-memory source that yields its batches once, in order
#[derive(Debug, Default)]
pub struct VecSource {
    batches: std::collections::VecDeque<BatchOutputs>,
}

impl VecSource {
    pub fn new(batches: Vec<BatchOutputs>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

impl InferenceSource for VecSource {
    fn forward(&mut self) -> Result<Option<BatchOutputs>, InferenceError> {
        Ok(self.batches.pop_front())
    }
}

/// On-disk batch dump, nested arrays in row-major order
///
/// Blobs are dumped as the captioner emits them, so counts and ids may arrive
/// as floats.
#[derive(Debug, Deserialize)]
struct BatchDump {
    num_boxes: Vec<f64>,
    boxes: Vec<Vec<[f32; 4]>>,
    #[serde(default = "captioner_box_offset")]
    box_offset: usize,
    image_id: Vec<DumpId>,
    att_weights: Vec<Vec<Vec<f32>>>,
    bs_sentences: Vec<Vec<Vec<f32>>>,
    caption: Vec<Vec<f32>>,
}

fn captioner_box_offset() -> usize {
    CAPTIONER_BOX_OFFSET
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DumpId {
    Int(u64),
    Float(f64),
    Text(String),
}

/// Integral, non-negative float as an integer
fn integral(output: &str, idx: usize, value: f64) -> Result<u64, InferenceError> {
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 {
        Ok(value as u64)
    } else {
        Err(shape_error(
            output,
            format!("entry {idx} is {value}, expected a non-negative integer"),
        ))
    }
}

impl DumpId {
    fn into_id(self, idx: usize) -> Result<String, InferenceError> {
        match self {
            DumpId::Int(id) => Ok(id.to_string()),
            DumpId::Float(id) => integral("image_id", idx, id).map(|id| id.to_string()),
            DumpId::Text(id) => Ok(id),
        }
    }
}

fn rows_to_array2(name: &str, rows: Vec<Vec<f32>>) -> Result<Array2<f32>, InferenceError> {
    let nrows = rows.len();
    let ncols = rows.first().map_or(0, Vec::len);
    if let Some(bad) = rows.iter().position(|r| r.len() != ncols) {
        return Err(shape_error(
            name,
            format!("row {bad} has {} columns, expected {ncols}", rows[bad].len()),
        ));
    }
    let flat: Vec<f32> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((nrows, ncols), flat).map_err(|e| shape_error(name, e.to_string()))
}

impl BatchDump {
    fn into_outputs(self) -> Result<BatchOutputs, InferenceError> {
        let batch = self.boxes.len();
        let max_regions = self.boxes.iter().map(Vec::len).max().unwrap_or(0);
        let mut boxes = Array3::<f32>::zeros((batch, max_regions, 4));
        for (n, image_boxes) in self.boxes.iter().enumerate() {
            for (r, b) in image_boxes.iter().enumerate() {
                for (c, &v) in b.iter().enumerate() {
                    boxes[[n, r, c]] = v;
                }
            }
        }

        let attention = self
            .att_weights
            .into_iter()
            .enumerate()
            .map(|(step, rows)| rows_to_array2(&format!("att_weight_{step}"), rows))
            .collect::<Result<Vec<_>, _>>()?;
        let partial_tokens = self
            .bs_sentences
            .into_iter()
            .enumerate()
            .map(|(step, rows)| rows_to_array2(&format!("bs_sentence_{step}"), rows))
            .collect::<Result<Vec<_>, _>>()?;

        let num_boxes = self
            .num_boxes
            .iter()
            .enumerate()
            .map(|(idx, &n)| integral("num_boxes", idx, n).map(|n| n as usize))
            .collect::<Result<Vec<_>, _>>()?;
        let image_ids = self
            .image_id
            .into_iter()
            .enumerate()
            .map(|(idx, id)| id.into_id(idx))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BatchOutputs {
            num_boxes: Array1::from(num_boxes),
            boxes,
            box_offset: self.box_offset,
            image_ids,
            attention,
            partial_tokens,
            final_tokens: rows_to_array2("caption", self.caption)?,
        })
    }
}

/// Replays a directory of JSON batch dumps, cycling like a dataset layer
///
/// Files are read in name order. After the last file the source starts over,
/// so a sweep terminates through wraparound detection.
#[derive(Debug)]
pub struct JsonBatchSource {
    files: Vec<PathBuf>,
    next: usize,
}

impl JsonBatchSource {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, InferenceError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|source| InferenceError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(InferenceError::NoBatches(dir.display().to_string()));
        }

        info!("Batch source: {} dumps in {}", files.len(), dir.display());
        Ok(Self { files, next: 0 })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl InferenceSource for JsonBatchSource {
    fn forward(&mut self) -> Result<Option<BatchOutputs>, InferenceError> {
        let path = &self.files[self.next % self.files.len()];
        self.next += 1;
        debug!("Forward: {}", path.display());

        let contents = fs::read_to_string(path).map_err(|source| InferenceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let dump: BatchDump =
            serde_json::from_str(&contents).map_err(|source| InferenceError::Json {
                path: path.display().to_string(),
                source,
            })?;

        dump.into_outputs().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn outputs(batch: usize, beam: usize, regions: usize, steps: usize) -> BatchOutputs {
        let rows = batch * beam;
        BatchOutputs {
            num_boxes: Array1::from(vec![regions; batch]),
            boxes: Array3::zeros((batch, regions, 4)),
            box_offset: 0,
            image_ids: (0..batch).map(|n| n.to_string()).collect(),
            attention: vec![Array2::zeros((rows, regions)); steps],
            partial_tokens: vec![Array2::zeros((rows, 4)); steps],
            final_tokens: Array2::zeros((rows, 4)),
        }
    }

    #[test]
    fn test_validate_accepts_consistent_shapes() {
        assert!(outputs(2, 3, 5, 4).validate(2, 3).is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_beam_rows() {
        let err = outputs(2, 3, 5, 4).validate(2, 4).unwrap_err();
        assert!(matches!(err, InferenceError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_validate_rejects_too_many_regions() {
        let mut out = outputs(2, 3, 5, 1);
        out.num_boxes[1] = 6;
        let err = out.validate(2, 3).unwrap_err();
        assert!(err.to_string().contains("num_boxes"));
    }

    #[test]
    fn test_validate_counts_box_offset() {
        let mut out = outputs(2, 3, 5, 1);
        out.box_offset = 1;
        assert!(out.validate(2, 3).is_err());

        out.num_boxes = Array1::from(vec![4, 3]);
        assert!(out.validate(2, 3).is_ok());
    }

    #[test]
    fn test_primary_ids_from_beam_rows() {
        let mut out = outputs(2, 3, 1, 1);
        out.image_ids = vec!["7", "7", "7", "9", "9", "9"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(out.primary_image_ids(2, 3), vec!["7", "9"]);
    }

    #[test]
    fn test_blocks_select_image_rows() {
        let mut out = outputs(2, 2, 3, 1);
        out.attention[0][[2, 0]] = 0.5;
        let block = out.attention_block(0, 2, 2).unwrap();
        assert_eq!(block.nrows(), 2);
        assert_eq!(block[[0, 0]], 0.5);
        assert!(out.attention_block(0, 3, 2).is_none());
        assert!(out.token_block(1, 0, 2).is_none());
    }

    #[test]
    fn test_vec_source_exhausts() {
        let mut source = VecSource::new(vec![outputs(1, 1, 1, 1)]);
        assert!(source.forward().unwrap().is_some());
        assert!(source.forward().unwrap().is_none());
    }

    #[test]
    fn test_json_source_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let dump = r#"{
            "num_boxes": [1],
            "boxes": [[[0, 0, 640, 480], [0, 0, 10, 10]]],
            "image_id": [42],
            "att_weights": [[[1.0]]],
            "bs_sentences": [[[3, 1]]],
            "caption": [[3, 1]]
        }"#;
        fs::write(dir.path().join("batch_000.json"), dump).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut source = JsonBatchSource::open(dir.path()).unwrap();
        assert_eq!(source.len(), 1);

        let first = source.forward().unwrap().unwrap();
        assert_eq!(first.image_ids, vec!["42".to_string()]);
        assert_eq!(first.box_offset, CAPTIONER_BOX_OFFSET);
        assert!(first.validate(1, 1).is_ok());

        let again = source.forward().unwrap().unwrap();
        assert_eq!(again.image_ids, first.image_ids);
    }

    fn dump_with(num_boxes: &str, image_id: &str) -> String {
        format!(
            r#"{{
                "num_boxes": {num_boxes},
                "boxes": [[[0, 0, 10, 10]]],
                "box_offset": 0,
                "image_id": {image_id},
                "att_weights": [[[1.0]]],
                "bs_sentences": [[[3.0, 1.0]]],
                "caption": [[3.0, 1.0]]
            }}"#
        )
    }

    #[test]
    fn test_json_source_accepts_float_blobs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("batch_000.json"), dump_with("[1.0]", "[42.0]")).unwrap();

        let batch = JsonBatchSource::open(dir.path())
            .unwrap()
            .forward()
            .unwrap()
            .unwrap();
        assert_eq!(batch.num_boxes, Array1::from(vec![1]));
        assert_eq!(batch.image_ids, vec!["42".to_string()]);
        assert_eq!(batch.box_offset, 0);
        assert!(batch.validate(1, 1).is_ok());
    }

    #[test]
    fn test_json_source_rejects_fractional_blobs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.json"), dump_with("[1.5]", "[42]")).unwrap();
        let err = JsonBatchSource::open(dir.path()).unwrap().forward().unwrap_err();
        assert!(matches!(err, InferenceError::ShapeMismatch { ref output, .. } if output == "num_boxes"));

        fs::write(dir.path().join("a.json"), dump_with("[1]", "[42.25]")).unwrap();
        let err = JsonBatchSource::open(dir.path()).unwrap().forward().unwrap_err();
        assert!(matches!(err, InferenceError::ShapeMismatch { ref output, .. } if output == "image_id"));
    }

    #[test]
    fn test_json_source_rejects_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            JsonBatchSource::open(dir.path()),
            Err(InferenceError::NoBatches(_))
        ));
    }
}
