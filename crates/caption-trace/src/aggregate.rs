//! Merge per-image record files into one dataset-level index

use caption_attention_common::{read_record, write_json_atomic, ImageAttentionRecord, RecordError};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Failed to list {path}: {source}")]
    ReadDir {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to read merged file {path}: {source}")]
    Load { path: String, source: RecordError },

    #[error("Failed to write merged file {path}: {source}")]
    Write { path: String, source: RecordError },
}

/// Image id -> record, in key order
pub type MergedRecords = BTreeMap<String, ImageAttentionRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub merged: usize,
    pub skipped: usize,
}

/// Parse every `*.json` record in `src_dir`, keyed by its embedded image id
///
/// Unreadable or malformed files are skipped with a warning. Files are read in
/// name order; when two carry the same image id the later one replaces the
/// earlier and the replaced file counts as skipped.
pub fn collect_records<P: AsRef<Path>>(src_dir: P) -> Result<(MergedRecords, usize), AggregateError> {
    let src_dir = src_dir.as_ref();
    let mut paths: Vec<_> = fs::read_dir(src_dir)
        .map_err(|source| AggregateError::ReadDir {
            path: src_dir.display().to_string(),
            source,
        })?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect();
    paths.sort();

    let mut records = MergedRecords::new();
    let mut skipped = 0;

    for path in paths {
        if !path.is_file() {
            continue;
        }
        let fname = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !path.extension().is_some_and(|ext| ext == "json") {
            warn!("ignore file: {}", fname);
            skipped += 1;
            continue;
        }

        match read_record(&path) {
            Ok(record) => {
                if path.file_stem().is_some_and(|stem| stem != record.image_id.as_str()) {
                    warn!("{}: file name does not match image id {}", fname, record.image_id);
                }
                if records.insert(record.image_id.clone(), record).is_some() {
                    warn!("{}: duplicate image id, replacing the earlier record", fname);
                    skipped += 1;
                }
            }
            Err(e) => {
                warn!("ignore file: {} ({})", fname, e);
                skipped += 1;
            }
        }
    }

    Ok((records, skipped))
}

/// Merge `src_dir` into a single JSON object written to `out_file`
pub fn merge_directory<P: AsRef<Path>, Q: AsRef<Path>>(
    src_dir: P,
    out_file: Q,
) -> Result<MergeSummary, AggregateError> {
    let out_file = out_file.as_ref();
    let (records, skipped) = collect_records(src_dir)?;

    write_json_atomic(out_file, &records).map_err(|source| AggregateError::Write {
        path: out_file.display().to_string(),
        source,
    })?;

    info!(
        "Merged {} records into {} ({} skipped)",
        records.len(),
        out_file.display(),
        skipped
    );
    Ok(MergeSummary {
        merged: records.len(),
        skipped,
    })
}

/// Read a merged index back
pub fn load_merged<P: AsRef<Path>>(path: P) -> Result<MergedRecords, AggregateError> {
    let path = path.as_ref();
    let load_err = |source: RecordError| AggregateError::Load {
        path: path.display().to_string(),
        source,
    };

    let contents = fs::read_to_string(path).map_err(|e| load_err(e.into()))?;
    serde_json::from_str(&contents).map_err(|e| load_err(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str =
        r#"{"image_id": ID, "caption": "a dog .", "score": {}, "boxes": [], "steps": []}"#;

    #[test]
    fn test_non_json_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("5.json"), RECORD.replace("ID", "5")).unwrap();
        fs::write(dir.path().join("README"), "notes").unwrap();

        let (records, skipped) = collect_records(dir.path()).unwrap();
        assert_eq!(records.keys().collect::<Vec<_>>(), vec!["5"]);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_duplicate_image_id_keeps_later_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("7.json"), RECORD.replace("ID", "7")).unwrap();
        fs::write(
            dir.path().join("7_rerun.json"),
            RECORD.replace("ID", "7").replace("a dog .", "a cat ."),
        )
        .unwrap();

        let (records, skipped) = collect_records(dir.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records["7"].caption, "a cat .");
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        assert!(matches!(
            collect_records("/nonexistent/debug_att_dir"),
            Err(AggregateError::ReadDir { .. })
        ));
    }
}
