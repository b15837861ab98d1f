//! Merge command - combine per-image records into one index

use anyhow::{Context as _, Result};
use caption_trace::merge_directory;
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct MergeCommand {
    /// Directory of per-image record files
    #[arg(long, default_value = "debug_att_dir")]
    input_dir: PathBuf,

    /// Merged index to write
    #[arg(short, long, default_value = "merged_att_result.json")]
    output: PathBuf,
}

impl MergeCommand {
    pub fn execute(self) -> Result<()> {
        info!("=== Caption Attention Merge ===");
        info!("Input: {}", self.input_dir.display());

        let summary = merge_directory(&self.input_dir, &self.output).with_context(|| {
            format!("Failed to merge records from {}", self.input_dir.display())
        })?;

        info!("Merged records: {}", summary.merged);
        info!("Skipped files: {}", summary.skipped);
        info!("Output: {}", self.output.display());
        Ok(())
    }
}
