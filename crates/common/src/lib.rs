/// Common types and utilities for caption attention inspection
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Record persistence errors
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to persist {path}: {source}")]
    Persist {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid record: {0}")]
    Invalid(String),
}

/// Result type for record operations
pub type Result<T> = std::result::Result<T, RecordError>;

/// Accepts an image identifier encoded either as a JSON number or a string.
///
/// Caption sources emit integer ids while score sources key by string, so
/// every id is normalised to its decimal string form.
pub fn deserialize_image_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(u64),
        Str(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Int(id) => Ok(id.to_string()),
        RawId::Str(id) => Ok(id),
    }
}

/// Region bounding box in source image pixels, stored as `[left, top, right, bottom]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct RegionBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl RegionBox {
    #[must_use]
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    #[must_use]
    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    #[must_use]
    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }
}

impl From<[f32; 4]> for RegionBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<RegionBox> for [f32; 4] {
    fn from(b: RegionBox) -> Self {
        [b.left, b.top, b.right, b.bottom]
    }
}

/// Named quality scores for one caption (e.g. `Bleu_1`..`Bleu_4`, `CIDEr`)
///
/// Values are kept as raw JSON since some metrics report nested objects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScoreSet(pub BTreeMap<String, serde_json::Value>);

impl ScoreSet {
    /// Numeric value of a metric, if present and numeric
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(serde_json::Value::as_f64)
    }

    /// All numeric metrics in key order
    pub fn numeric(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|x| (k.as_str(), x)))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One decoding step of a caption trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    pub step: usize,
    /// Attention over the image's regions; `None` when no beam was being tracked
    pub attentions: Option<Vec<f32>>,
    /// Partial caption of the matched beam, empty when no beam matched
    pub caption: String,
}

/// Everything recorded for one image: caption, scores, regions and trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttentionRecord {
    #[serde(deserialize_with = "deserialize_image_id")]
    pub image_id: String,
    pub caption: String,
    #[serde(default)]
    pub score: ScoreSet,
    pub boxes: Vec<RegionBox>,
    pub steps: Vec<StepTrace>,
}

impl ImageAttentionRecord {
    /// Check that the record is usable for rendering
    pub fn validate(&self) -> Result<()> {
        for step in &self.steps {
            if let Some(atts) = &step.attentions {
                if atts.len() > self.boxes.len() {
                    return Err(RecordError::Invalid(format!(
                        "image {}: step {} has {} attention weights for {} boxes",
                        self.image_id,
                        step.step,
                        atts.len(),
                        self.boxes.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Path of the per-image record file inside `dir`
#[must_use]
pub fn record_path(dir: &Path, image_id: &str) -> std::path::PathBuf {
    dir.join(format!("{image_id}.json"))
}

/// Write a record as JSON, replacing `path` atomically
pub fn write_record(path: &Path, record: &ImageAttentionRecord) -> Result<()> {
    write_json_atomic(path, record)
}

/// Serialize any value to `path` through a temporary file in the same directory
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let temp_file = NamedTempFile::new_in(parent)?;
    {
        let mut writer = BufWriter::new(temp_file.as_file());
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
    }
    temp_file.persist(path).map_err(|e| RecordError::Persist {
        path: path.display().to_string(),
        source: e.error,
    })?;

    debug!("Wrote {}", path.display());
    Ok(())
}

/// Read one per-image record file
pub fn read_record(path: &Path) -> Result<ImageAttentionRecord> {
    let contents = fs::read_to_string(path)?;
    let record: ImageAttentionRecord = serde_json::from_str(&contents)?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ImageAttentionRecord {
        ImageAttentionRecord {
            image_id: "42".to_string(),
            caption: "a red ball .".to_string(),
            score: ScoreSet(BTreeMap::from([(
                "Bleu_1".to_string(),
                serde_json::json!(0.75),
            )])),
            boxes: vec![RegionBox::new(1.0, 2.0, 11.0, 22.0)],
            steps: vec![StepTrace {
                step: 0,
                attentions: Some(vec![1.0]),
                caption: "A".to_string(),
            }],
        }
    }

    #[test]
    fn test_region_box_serializes_as_array() {
        let json = serde_json::to_string(&RegionBox::new(1.0, 2.0, 3.0, 4.0)).unwrap();
        assert_eq!(json, "[1.0,2.0,3.0,4.0]");
    }

    #[test]
    fn test_record_accepts_integer_image_id() {
        let json = r#"{"image_id": 42, "caption": "x", "score": {}, "boxes": [], "steps": []}"#;
        let record: ImageAttentionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.image_id, "42");
    }

    #[test]
    fn test_missing_attention_is_null() {
        let step = StepTrace {
            step: 3,
            attentions: None,
            caption: String::new(),
        };
        let value = serde_json::to_value(&step).unwrap();
        assert!(value["attentions"].is_null());
    }

    #[test]
    fn test_score_metric_lookup() {
        let record = sample_record();
        assert_eq!(record.score.metric("Bleu_1"), Some(0.75));
        assert_eq!(record.score.metric("CIDEr"), None);
    }

    #[test]
    fn test_validate_rejects_extra_weights() {
        let mut record = sample_record();
        record.steps[0].attentions = Some(vec![0.5, 0.5]);
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_write_and_read_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = record_path(dir.path(), "42");
        let record = sample_record();

        write_record(&path, &record).unwrap();
        assert_eq!(read_record(&path).unwrap(), record);
    }
}
