//! Batch orchestration
//!
//! Drives the inference source one batch at a time and hands every new image
//! to the [`BeamTracker`]. The dataset layer behind the source cycles, so the
//! first image id seen twice marks the end of one full sweep; that batch is
//! not processed.

use crate::inference::InferenceSource;
use crate::tracker::{BeamTracker, TraceError};
use crate::vocabulary::Vocabulary;
use caption_attention_common::{record_path, write_record, RecordError, ScoreSet};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Inference failed on batch {batch}: {source}")]
    Inference {
        batch: usize,
        source: crate::inference::InferenceError,
    },

    #[error("Tracing image {image_id} failed: {source}")]
    Trace { image_id: String, source: TraceError },

    #[error("Failed to save record for image {image_id}: {source}")]
    Record {
        image_id: String,
        source: RecordError,
    },

    #[error("Invalid sweep configuration: {0}")]
    InvalidConfig(String),
}

/// Why a sweep ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// An image id from an earlier batch came around again
    Wraparound { image_id: String },
    /// The source reported no more batches
    Exhausted,
}

/// Counters for one sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub batches: usize,
    pub traced: usize,
    pub already_present: usize,
    pub missing_caption: usize,
    pub stop: StopReason,
}

/// Runs one full, non-overlapping pass over an inference source
pub struct BatchOrchestrator<'a> {
    vocab: &'a Vocabulary,
    captions: &'a HashMap<String, String>,
    scores: &'a HashMap<String, ScoreSet>,
    output_dir: PathBuf,
    batch_size: usize,
    beam_size: usize,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(
        vocab: &'a Vocabulary,
        captions: &'a HashMap<String, String>,
        scores: &'a HashMap<String, ScoreSet>,
        output_dir: impl Into<PathBuf>,
        batch_size: usize,
        beam_size: usize,
    ) -> Result<Self, SweepError> {
        if batch_size == 0 || beam_size == 0 {
            return Err(SweepError::InvalidConfig(format!(
                "batch_size ({batch_size}) and beam_size ({beam_size}) must be positive"
            )));
        }
        Ok(Self {
            vocab,
            captions,
            scores,
            output_dir: output_dir.into(),
            batch_size,
            beam_size,
        })
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Sweep the source until wraparound or exhaustion
    ///
    /// Inference and shape errors abort the whole run.
    pub fn run<S: InferenceSource>(&self, source: &mut S) -> Result<SweepSummary, SweepError> {
        let tracker = BeamTracker::new(self.vocab, self.beam_size);
        let mut seen: HashSet<String> = HashSet::new();
        let mut summary = SweepSummary {
            batches: 0,
            traced: 0,
            already_present: 0,
            missing_caption: 0,
            stop: StopReason::Exhausted,
        };

        loop {
            let batch = summary.batches;
            let outputs = match source
                .forward()
                .map_err(|source| SweepError::Inference { batch, source })?
            {
                Some(outputs) => outputs,
                None => {
                    info!("Inference source exhausted after {} batches", batch);
                    break;
                }
            };
            outputs
                .validate(self.batch_size, self.beam_size)
                .map_err(|source| SweepError::Inference { batch, source })?;

            let batch_ids: Vec<String> = outputs
                .primary_image_ids(self.batch_size, self.beam_size)
                .into_iter()
                .map(str::to_string)
                .collect();

            if let Some(repeat) = first_repeat(&mut seen, &batch_ids) {
                info!("Image {} seen before, sweep complete", repeat);
                summary.stop = StopReason::Wraparound { image_id: repeat };
                break;
            }

            for (slot, image_id) in batch_ids.iter().enumerate() {
                self.process_image(&tracker, &outputs, slot, image_id, &mut summary)?;
            }

            info!("Iteration: {}", batch);
            summary.batches += 1;
        }

        info!(
            "Sweep done: {} batches, {} traced, {} already present, {} without caption",
            summary.batches, summary.traced, summary.already_present, summary.missing_caption
        );
        Ok(summary)
    }

    fn process_image(
        &self,
        tracker: &BeamTracker<'_>,
        outputs: &crate::inference::BatchOutputs,
        slot: usize,
        image_id: &str,
        summary: &mut SweepSummary,
    ) -> Result<(), SweepError> {
        let target = record_path(&self.output_dir, image_id);
        if target.exists() {
            debug!("Record exists, skipping: {}", target.display());
            summary.already_present += 1;
            return Ok(());
        }

        let Some(caption) = self.captions.get(image_id) else {
            warn!("No predicted caption for image {}, skipping", image_id);
            summary.missing_caption += 1;
            return Ok(());
        };

        let score = self.scores.get(image_id).cloned().unwrap_or_else(|| {
            warn!("No scores for image {}", image_id);
            ScoreSet::default()
        });

        info!("=== Start debugging image: {} ===", image_id);
        debug!("predicted caption: {}", caption);
        if let Some(final_row) = outputs.final_row(slot * self.beam_size) {
            if let Ok(decoded) = self.vocab.translate(final_row) {
                debug!("beam row 0 final sequence: {}", decoded);
            }
        }

        let record = tracker
            .trace_record(outputs, slot, image_id, caption, score)
            .map_err(|source| SweepError::Trace {
                image_id: image_id.to_string(),
                source,
            })?;

        info!("Saving: {}", target.display());
        write_record(&target, &record).map_err(|source| SweepError::Record {
            image_id: image_id.to_string(),
            source,
        })?;
        summary.traced += 1;
        Ok(())
    }
}

/// Record the batch's ids as seen, returning the first one already present
///
/// Ids before the repeat stay marked; the batch is abandoned anyway.
fn first_repeat(seen: &mut HashSet<String>, batch_ids: &[String]) -> Option<String> {
    for id in batch_ids {
        if !seen.insert(id.clone()) {
            return Some(id.clone());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_repeat_within_and_across_batches() {
        let mut seen = HashSet::new();
        let ids = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(first_repeat(&mut seen, &ids(&["1", "2"])), None);
        assert_eq!(first_repeat(&mut seen, &ids(&["3", "1"])), Some("1".to_string()));

        let mut fresh = HashSet::new();
        assert_eq!(first_repeat(&mut fresh, &ids(&["5", "5"])), Some("5".to_string()));
    }

    #[test]
    fn test_zero_beam_rejected() {
        let vocab = Vocabulary::from_words(["."]);
        let captions = HashMap::new();
        let scores = HashMap::new();
        assert!(matches!(
            BatchOrchestrator::new(&vocab, &captions, &scores, "out", 2, 0),
            Err(SweepError::InvalidConfig(_))
        ));
    }
}
