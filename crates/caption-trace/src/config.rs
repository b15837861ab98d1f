//! Trace run configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config {path}: {source}")]
    Yaml {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Inputs and batch layout of one tracing sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Vocabulary file, one token per line
    pub vocab_path: PathBuf,
    /// Image id -> scores JSON
    pub scores_path: PathBuf,
    /// Predicted captions JSON
    pub captions_path: PathBuf,
    /// Directory of batch dumps replayed as the inference source
    pub batches_dir: PathBuf,
    /// Where per-image records are written
    pub output_dir: PathBuf,
    /// Images per forward batch
    pub batch_size: usize,
    /// Beam rows per image
    pub beam_size: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            vocab_path: PathBuf::from("data/coco_splits/train_vocab.txt"),
            scores_path: PathBuf::from("scores.json"),
            captions_path: PathBuf::from("captions.json"),
            batches_dir: PathBuf::from("batches"),
            output_dir: PathBuf::from("debug_att_dir"),
            batch_size: 12,
            beam_size: 5,
        }
    }
}

impl TraceConfig {
    /// Load from YAML; missing keys take their defaults
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_config_default() {
        let config = TraceConfig::default();
        assert_eq!(config.batch_size, 12);
        assert_eq!(config.beam_size, 5);
        assert_eq!(config.output_dir, PathBuf::from("debug_att_dir"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.yaml");
        std::fs::write(&path, "beam_size: 3\nvocab_path: vocab.txt\n").unwrap();

        let config = TraceConfig::from_yaml(&path).unwrap();
        assert_eq!(config.beam_size, 3);
        assert_eq!(config.batch_size, 12);
        assert_eq!(config.vocab_path, PathBuf::from("vocab.txt"));
    }
}
