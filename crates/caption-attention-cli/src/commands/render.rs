//! Render command - annotated attention figures from a merged index

use anyhow::{Context as _, Result};
use attention_render::{AttentionRenderer, ImageLocator, RenderConfig};
use caption_trace::load_merged;
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct RenderCommand {
    /// Merged index mapping image id to attention record
    #[arg(long = "id2info", default_value = "merged_att_result.json")]
    id2info: PathBuf,

    /// Dataset root holding the <split>2014 image folders
    #[arg(long, default_value = ".")]
    image_dir: PathBuf,

    /// Attended regions drawn per step
    #[arg(long, default_value = "3")]
    top_n: usize,

    /// Directory for the rendered figures
    #[arg(long)]
    result_dir: PathBuf,

    /// Panels per grid row
    #[arg(long, default_value = "4")]
    columns: usize,

    /// Panel width in pixels
    #[arg(long, default_value = "320")]
    panel_width: u32,

    /// TrueType font for titles and labels (system fonts are searched otherwise)
    #[arg(long)]
    font: Option<PathBuf>,

    /// Dataset splits searched for source images, in order
    #[arg(long, value_delimiter = ',', default_value = "train,val")]
    splits: Vec<String>,
}

impl RenderCommand {
    pub fn execute(self) -> Result<()> {
        info!("=== Caption Attention Render ===");
        info!("Index: {}", self.id2info.display());
        info!("Image directory: {}", self.image_dir.display());
        info!("Result directory: {}", self.result_dir.display());

        if !self.id2info.is_file() {
            anyhow::bail!("Error! file not exist: {}", self.id2info.display());
        }

        let records = load_merged(&self.id2info).context("Failed to load merged index")?;
        info!("Records: {}", records.len());

        let config = RenderConfig {
            top_n: self.top_n,
            columns: self.columns,
            panel_width: self.panel_width,
            font_path: self.font,
            ..RenderConfig::default()
        };
        let renderer = AttentionRenderer::new(config).context("Failed to set up renderer")?;
        let locator = ImageLocator {
            splits: self.splits,
            ..ImageLocator::default()
        };

        let summary = renderer
            .render_dataset(&records, &self.image_dir, &self.result_dir, &locator)
            .context("Rendering failed")?;

        info!("=== Render Complete ===");
        info!("Rendered: {}", summary.rendered);
        info!("Already rendered: {}", summary.already_rendered);
        info!("Missing images: {}", summary.missing_image);
        info!("Failed: {}", summary.failed);
        Ok(())
    }
}
