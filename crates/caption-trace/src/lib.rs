//! Beam alignment and attention extraction for region-attention captioners
//!
//! A captioner decoding with beam search keeps `beam` parallel hypotheses per
//! image while attending over a fixed set of detected regions. This crate
//! reconstructs, for each image's chosen caption, which beam row carried that
//! caption at every decoding step and the attention vector it used, and
//! persists the result as one [`ImageAttentionRecord`] per image.
//!
//! # Components
//! - [`vocabulary`]: index sequence -> caption string
//! - [`tracker`]: per-image, per-step beam selection (first-match-wins)
//! - [`orchestrator`]: batch-sequential sweep over an [`inference::InferenceSource`]
//! - [`aggregate`]: per-image record files -> one merged index
//!
//! # Example
//! ```no_run
//! use caption_trace::{load_captions, load_scores, BatchOrchestrator, JsonBatchSource, Vocabulary};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let vocab = Vocabulary::from_file("train_vocab.txt")?;
//! let captions = load_captions("captions.json")?;
//! let scores = load_scores("scores.json")?;
//!
//! let mut source = JsonBatchSource::open("batches")?;
//! let orchestrator = BatchOrchestrator::new(&vocab, &captions, &scores, "debug_att_dir", 12, 5)?;
//! let summary = orchestrator.run(&mut source)?;
//! println!("traced {} images", summary.traced);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod config;
pub mod inference;
pub mod orchestrator;
pub mod sources;
pub mod tracker;
pub mod vocabulary;

pub use aggregate::{collect_records, load_merged, merge_directory, AggregateError, MergeSummary, MergedRecords};
pub use caption_attention_common::{
    read_record as read_record_file, ImageAttentionRecord, RegionBox, ScoreSet, StepTrace,
};
pub use config::{ConfigError, TraceConfig};
pub use inference::{
    BatchOutputs, InferenceError, CAPTIONER_BOX_OFFSET, InferenceSource, JsonBatchSource, VecSource,
};
pub use orchestrator::{BatchOrchestrator, StopReason, SweepError, SweepSummary};
pub use sources::{load_captions, load_scores, CaptionEntry, SourceError};
pub use tracker::{caption_tokens, BeamState, BeamTracker, PrefixMatcher, TraceError};
pub use vocabulary::{Vocabulary, VocabularyError};
