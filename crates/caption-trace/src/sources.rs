//! Score and caption sources, loaded once at startup

use caption_attention_common::{deserialize_image_id, ScoreSet};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Json {
        path: String,
        source: serde_json::Error,
    },
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, SourceError> {
    let contents = fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| SourceError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Image id -> quality scores
pub fn load_scores<P: AsRef<Path>>(path: P) -> Result<HashMap<String, ScoreSet>, SourceError> {
    let path = path.as_ref();
    info!("loading score file: {}", path.display());

    let scores: HashMap<String, ScoreSet> = read_json(path)?;
    info!("scored images number: {}", scores.len());
    Ok(scores)
}

/// One entry of the caption source
#[derive(Debug, Clone, Deserialize)]
pub struct CaptionEntry {
    #[serde(deserialize_with = "deserialize_image_id")]
    pub image_id: String,
    pub caption: String,
}

/// Image id -> final caption; later duplicates override earlier ones
pub fn load_captions<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>, SourceError> {
    let path = path.as_ref();
    info!("loading caption file: {}", path.display());

    let entries: Vec<CaptionEntry> = read_json(path)?;
    info!("number : {}", entries.len());

    let captions: HashMap<String, String> = entries
        .into_iter()
        .map(|e| (e.image_id, e.caption))
        .collect();
    info!("id2pre_caption len: {}", captions.len());
    Ok(captions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_captions_mixed_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captions.json");
        fs::write(
            &path,
            r#"[{"image_id": 42, "caption": "a dog ."},
                {"image_id": "7", "caption": "a cat ."},
                {"image_id": 42, "caption": "a red dog ."}]"#,
        )
        .unwrap();

        let captions = load_captions(&path).unwrap();
        assert_eq!(captions.len(), 2);
        assert_eq!(captions["42"], "a red dog .");
        assert_eq!(captions["7"], "a cat .");
    }

    #[test]
    fn test_load_scores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.json");
        fs::write(
            &path,
            r#"{"42": {"Bleu_1": 0.9, "SPICE": {"All": {"f": 0.2}}}}"#,
        )
        .unwrap();

        let scores = load_scores(&path).unwrap();
        assert_eq!(scores["42"].metric("Bleu_1"), Some(0.9));
        assert_eq!(scores["42"].metric("SPICE"), None);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = load_scores("/nonexistent/scores.json").unwrap_err();
        assert!(matches!(err, SourceError::Io { .. }));
    }
}
