//! Beam tracking
//!
//! Beam hypotheses have no identity across decoding steps. The only handle on
//! "the hypothesis that became the final caption" is textual: at every step the
//! tracker translates each beam row of the image and keeps the first row whose
//! partial caption is a case-insensitive prefix of the final caption. That row's
//! attention vector is the one recorded at the following step.
//!
//! Two beams carrying the same prefix cannot be told apart; the lowest row
//! index wins. A step where no row matches records an empty caption and leaves
//! no row tracked for the next step.

use crate::inference::{BatchOutputs, InferenceError};
use crate::vocabulary::{Vocabulary, VocabularyError};
use caption_attention_common::{ImageAttentionRecord, RegionBox, ScoreSet, StepTrace};
use ndarray::ArrayView2;
use std::convert::Infallible;
use thiserror::Error;
use tracing::debug;

/// Errors that abort tracing of an image
#[derive(Error, Debug)]
pub enum TraceError {
    #[error(transparent)]
    Vocabulary(#[from] VocabularyError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("Caption needs {needed} decoding steps but the batch only has {available}")]
    MissingSteps { needed: usize, available: usize },

    #[error("Image slot {slot} outside batch of {batch_size}")]
    SlotOutOfRange { slot: usize, batch_size: usize },
}

/// Split a final caption into the tokens the decoder emitted
///
/// Whitespace tokens followed by a "." terminal marker, so the result is
/// never empty. A period already present is kept as its own step.
#[must_use]
pub fn caption_tokens(caption: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = caption.split_whitespace().collect();
    tokens.push(".");
    tokens
}

/// First-match-wins prefix policy against a known final caption
#[derive(Debug, Clone)]
pub struct PrefixMatcher {
    target: String,
}

impl PrefixMatcher {
    pub fn new(final_caption: &str) -> Self {
        Self {
            target: final_caption.to_lowercase(),
        }
    }

    /// Whether `partial` is a case-insensitive prefix of the final caption
    #[must_use]
    pub fn matches(&self, partial: &str) -> bool {
        self.target.starts_with(&partial.to_lowercase())
    }

    /// Scan rows `0..rows` in order, producing each row's partial caption
    /// lazily, and stop at the first one that matches
    ///
    /// Rows after the winner are never produced.
    pub fn first_match_with<F, E>(&self, rows: usize, mut partial_of: F) -> Result<Option<(usize, String)>, E>
    where
        F: FnMut(usize) -> Result<String, E>,
    {
        for row in 0..rows {
            let partial = partial_of(row)?;
            if self.matches(&partial) {
                return Ok(Some((row, partial)));
            }
        }
        Ok(None)
    }

    /// Index of the first matching partial caption
    pub fn first_match<S: AsRef<str>>(&self, partials: &[S]) -> Option<usize> {
        let found: Result<_, Infallible> = self.first_match_with(partials.len(), |row| {
            Ok(partials[row].as_ref().to_string())
        });
        match found {
            Ok(hit) => hit.map(|(row, _)| row),
            Err(never) => match never {},
        }
    }
}

/// Per-image tracking flags, one per beam row
///
/// Threaded explicitly through the step loop; never shared between images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeamState {
    active: Vec<bool>,
}

impl BeamState {
    /// All rows active, the state before step 0
    #[must_use]
    pub fn all_active(beam_size: usize) -> Self {
        Self {
            active: vec![true; beam_size],
        }
    }

    /// Only `row` active, or nothing when `None`
    #[must_use]
    pub fn tracking(row: Option<usize>, beam_size: usize) -> Self {
        let mut active = vec![false; beam_size];
        if let Some(flag) = row.and_then(|r| active.get_mut(r)) {
            *flag = true;
        }
        Self { active }
    }

    #[must_use]
    pub fn first_active(&self) -> Option<usize> {
        self.active.iter().position(|&a| a)
    }

    #[must_use]
    pub fn active(&self) -> &[bool] {
        &self.active
    }
}

/// Walks the decoding steps of one image and records its caption trace
#[derive(Debug, Clone, Copy)]
pub struct BeamTracker<'v> {
    vocab: &'v Vocabulary,
    beam_size: usize,
}

impl<'v> BeamTracker<'v> {
    pub fn new(vocab: &'v Vocabulary, beam_size: usize) -> Self {
        Self { vocab, beam_size }
    }

    #[must_use]
    pub fn beam_size(&self) -> usize {
        self.beam_size
    }

    /// Advance one decoding step
    ///
    /// `attention` and `tokens` are this image's beam block for the step.
    /// Returns the step's trace entry and the state for the next step.
    pub fn step(
        &self,
        state: &BeamState,
        step: usize,
        attention: ArrayView2<'_, f32>,
        tokens: ArrayView2<'_, f32>,
        num_regions: usize,
        matcher: &PrefixMatcher,
    ) -> Result<(StepTrace, BeamState), TraceError> {
        let kept_row = if step == 0 {
            Some(0)
        } else {
            state.first_active()
        };
        let attentions = kept_row
            .filter(|&row| row < attention.nrows())
            .map(|row| {
                attention
                    .row(row)
                    .iter()
                    .take(num_regions)
                    .copied()
                    .collect::<Vec<f32>>()
            });

        let rows = self.beam_size.min(tokens.nrows());
        let hit = matcher.first_match_with(rows, |row| self.vocab.translate(tokens.row(row)))?;

        let (matched_row, caption) = match hit {
            Some((row, partial)) => (Some(row), partial),
            None => {
                debug!("step {step}: no beam matches the final caption");
                (None, String::new())
            }
        };

        let entry = StepTrace {
            step,
            attentions,
            caption,
        };
        Ok((entry, BeamState::tracking(matched_row, self.beam_size)))
    }

    /// Trace every step of the image in `slot` against its final caption
    pub fn trace_steps(
        &self,
        outputs: &BatchOutputs,
        slot: usize,
        final_caption: &str,
    ) -> Result<Vec<StepTrace>, TraceError> {
        let batch_size = outputs.num_boxes.len();
        if slot >= batch_size {
            return Err(TraceError::SlotOutOfRange { slot, batch_size });
        }

        let num_steps = caption_tokens(final_caption).len();
        if num_steps > outputs.num_steps() {
            return Err(TraceError::MissingSteps {
                needed: num_steps,
                available: outputs.num_steps(),
            });
        }

        let num_regions = region_count(outputs, slot)?;
        let first_row = slot * self.beam_size;
        let matcher = PrefixMatcher::new(final_caption);

        let mut state = BeamState::all_active(self.beam_size);
        let mut steps = Vec::with_capacity(num_steps);

        for step in 0..num_steps {
            let attention = outputs
                .attention_block(step, first_row, self.beam_size)
                .ok_or_else(|| block_error(format!("att_weight_{step}"), first_row, self.beam_size))?;
            let tokens = outputs
                .token_block(step, first_row, self.beam_size)
                .ok_or_else(|| block_error(format!("bs_sentence_{step}"), first_row, self.beam_size))?;

            let (entry, next) =
                self.step(&state, step, attention, tokens, num_regions, &matcher)?;
            debug!("step {}: '{}'", step, entry.caption);
            steps.push(entry);
            state = next;
        }

        Ok(steps)
    }

    /// Build the complete attention record of one image
    pub fn trace_record(
        &self,
        outputs: &BatchOutputs,
        slot: usize,
        image_id: &str,
        final_caption: &str,
        score: ScoreSet,
    ) -> Result<ImageAttentionRecord, TraceError> {
        let steps = self.trace_steps(outputs, slot, final_caption)?;

        let num_regions = region_count(outputs, slot)?;
        let boxes = (outputs.box_offset..outputs.box_offset + num_regions)
            .map(|r| {
                RegionBox::new(
                    outputs.boxes[[slot, r, 0]],
                    outputs.boxes[[slot, r, 1]],
                    outputs.boxes[[slot, r, 2]],
                    outputs.boxes[[slot, r, 3]],
                )
            })
            .collect();

        Ok(ImageAttentionRecord {
            image_id: image_id.to_string(),
            caption: final_caption.to_string(),
            score,
            boxes,
            steps,
        })
    }
}

/// Declared regions of `slot`, checked against the box block
fn region_count(outputs: &BatchOutputs, slot: usize) -> Result<usize, TraceError> {
    let num_regions = outputs.num_boxes[slot];
    let max_regions = outputs.boxes.dim().1;
    if outputs.box_offset + num_regions > max_regions {
        return Err(TraceError::Inference(InferenceError::ShapeMismatch {
            output: "boxes".to_string(),
            detail: format!(
                "image slot {slot} declares {num_regions} regions after offset {}, block holds {max_regions}",
                outputs.box_offset
            ),
        }));
    }
    Ok(num_regions)
}

fn block_error(output: String, first_row: usize, beam_size: usize) -> TraceError {
    TraceError::Inference(InferenceError::ShapeMismatch {
        output,
        detail: format!("rows {first_row}..{} not available", first_row + beam_size),
    })
}
