//! Trace command - one sweep over the inference batches

use anyhow::{Context as _, Result};
use caption_trace::{
    load_captions, load_scores, BatchOrchestrator, JsonBatchSource, StopReason, TraceConfig,
    Vocabulary,
};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct TraceCommand {
    /// YAML file with the run configuration; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of batch dumps produced by the captioner
    #[arg(long)]
    batches: Option<PathBuf>,

    /// Directory for per-image records
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Vocabulary file, one token per line
    #[arg(long)]
    vocab: Option<PathBuf>,

    /// Image id -> scores JSON
    #[arg(long)]
    scores: Option<PathBuf>,

    /// Predicted captions JSON
    #[arg(long)]
    captions: Option<PathBuf>,

    /// Images per forward batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Beam rows per image
    #[arg(long)]
    beam_size: Option<usize>,
}

impl TraceCommand {
    fn resolve_config(&self) -> Result<TraceConfig> {
        let mut config = match &self.config {
            Some(path) => TraceConfig::from_yaml(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => TraceConfig::default(),
        };

        if let Some(v) = &self.batches {
            config.batches_dir = v.clone();
        }
        if let Some(v) = &self.output_dir {
            config.output_dir = v.clone();
        }
        if let Some(v) = &self.vocab {
            config.vocab_path = v.clone();
        }
        if let Some(v) = &self.scores {
            config.scores_path = v.clone();
        }
        if let Some(v) = &self.captions {
            config.captions_path = v.clone();
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.beam_size {
            config.beam_size = v;
        }
        Ok(config)
    }

    pub fn execute(self) -> Result<()> {
        let config = self.resolve_config()?;

        info!("=== Caption Attention Trace ===");
        info!("Batches: {}", config.batches_dir.display());
        info!("Output directory: {}", config.output_dir.display());
        info!(
            "Batch size: {}, beam size: {}",
            config.batch_size, config.beam_size
        );

        // All inputs load up front; any failure aborts before the sweep
        let scores = load_scores(&config.scores_path).context("Failed to load scores")?;
        let captions = load_captions(&config.captions_path).context("Failed to load captions")?;
        let vocab = Vocabulary::from_file(&config.vocab_path).context("Failed to load vocabulary")?;
        let mut source = JsonBatchSource::open(&config.batches_dir)
            .context("Failed to open inference batches")?;

        std::fs::create_dir_all(&config.output_dir).with_context(|| {
            format!("Failed to create {}", config.output_dir.display())
        })?;

        let orchestrator = BatchOrchestrator::new(
            &vocab,
            &captions,
            &scores,
            &config.output_dir,
            config.batch_size,
            config.beam_size,
        )?;
        let summary = orchestrator.run(&mut source).context("Trace sweep failed")?;

        info!("=== Trace Complete ===");
        info!("Batches: {}", summary.batches);
        info!("Images traced: {}", summary.traced);
        info!("Already present: {}", summary.already_present);
        info!("Without caption: {}", summary.missing_caption);
        match summary.stop {
            StopReason::Wraparound { image_id } => {
                info!("Stopped at image {} (dataset wrapped around)", image_id);
            }
            StopReason::Exhausted => info!("Stopped: inference source exhausted"),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(config: Option<PathBuf>) -> TraceCommand {
        TraceCommand {
            config,
            batches: None,
            output_dir: Some(PathBuf::from("records")),
            vocab: None,
            scores: None,
            captions: None,
            batch_size: None,
            beam_size: Some(3),
        }
    }

    #[test]
    fn test_flags_override_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.yaml");
        std::fs::write(&path, "beam_size: 7\nbatch_size: 4\noutput_dir: elsewhere\n").unwrap();

        let config = command(Some(path)).resolve_config().unwrap();
        assert_eq!(config.beam_size, 3);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.output_dir, PathBuf::from("records"));
    }

    #[test]
    fn test_defaults_without_config_file() {
        let config = command(None).resolve_config().unwrap();
        assert_eq!(config.batch_size, 12);
        assert_eq!(config.beam_size, 3);
    }
}
