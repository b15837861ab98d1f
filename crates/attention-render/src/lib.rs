//! Attention rendering
//!
//! Renders an [`ImageAttentionRecord`] as one annotated figure: a grid of
//! panels, one per decoding step, each showing the source image with the
//! step's top-N attended regions boxed and labelled with their weight, titled
//! with the word decoded at that step. The figure header lists the caption's
//! evaluation scores.
//!
//! Rendering is idempotent: an existing output file is never recomputed.
//!
//! # Example
//! ```no_run
//! use attention_render::{AttentionRenderer, ImageLocator, RenderConfig};
//! use std::collections::BTreeMap;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let records: BTreeMap<String, _> = BTreeMap::new();
//! let renderer = AttentionRenderer::new(RenderConfig::default())?;
//! let summary = renderer.render_dataset(
//!     &records,
//!     Path::new("coco"),
//!     Path::new("attention_images"),
//!     &ImageLocator::default(),
//! )?;
//! println!("rendered {}", summary.rendered);
//! # Ok(())
//! # }
//! ```

pub mod font;
pub mod locate;
pub mod visualization;

use ab_glyph::{FontVec, PxScale};
use caption_attention_common::{ImageAttentionRecord, RecordError, ScoreSet};
use image::{imageops, Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use locate::ImageLocator;
pub use visualization::{panel_title, rank_color, top_n_regions, weight_label};

/// Errors that can occur while rendering
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Font error: {0}")]
    Font(String),

    #[error("Invalid record: {0}")]
    Record(#[from] RecordError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Figure layout and annotation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Regions drawn per step
    pub top_n: usize,
    /// Panels per grid row
    pub columns: usize,
    /// Panel width in pixels; height follows the source aspect ratio
    pub panel_width: u32,
    /// Height of the title band above each panel
    pub title_height: u32,
    /// Height of the figure header with the scores
    pub header_height: u32,
    /// Gap between panels and around the grid
    pub margin: u32,
    /// Bounding box line thickness
    pub line_thickness: u32,
    /// Title font size in pixels; weight labels use three quarters of it
    pub font_size: f32,
    /// Font file; system fonts are searched when unset
    pub font_path: Option<PathBuf>,
    /// Scores listed in the figure header, in order
    pub score_keys: Vec<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            top_n: 3,
            columns: 4,
            panel_width: 320,
            title_height: 22,
            header_height: 28,
            margin: 6,
            line_thickness: 2,
            font_size: 14.0,
            font_path: None,
            score_keys: (1..=4).map(|n| format!("Bleu_{n}")).collect(),
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.columns == 0 {
            return Err(RenderError::InvalidConfig("columns must be positive".into()));
        }
        if self.panel_width == 0 {
            return Err(RenderError::InvalidConfig("panel_width must be positive".into()));
        }
        Ok(())
    }
}

/// Result of rendering one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered(PathBuf),
    /// Output already existed; nothing was recomputed
    AlreadyRendered(PathBuf),
}

/// Counters for one dataset run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderSummary {
    pub total: usize,
    pub rendered: usize,
    pub already_rendered: usize,
    pub missing_image: usize,
    pub failed: usize,
}

/// Output file for a source image: its base name with a `.png` extension
#[must_use]
pub fn output_path(source_image: &Path, result_dir: &Path) -> PathBuf {
    let stem = source_image
        .file_stem()
        .map_or_else(|| "image".into(), |s| s.to_string_lossy().into_owned());
    result_dir.join(format!("{stem}.png"))
}

/// Header line with the configured scores, or every numeric score if none match
#[must_use]
pub fn format_header(score: &ScoreSet, keys: &[String]) -> String {
    let selected: Vec<String> = keys
        .iter()
        .filter_map(|k| score.metric(k).map(|v| format!("{k} {v:.2}")))
        .collect();
    if !selected.is_empty() {
        return selected.join("  ");
    }
    score
        .numeric()
        .map(|(k, v)| format!("{k} {v:.2}"))
        .collect::<Vec<_>>()
        .join("  ")
}

/// Renders attention records into annotated figures
pub struct AttentionRenderer {
    config: RenderConfig,
    font: Option<FontVec>,
}

impl AttentionRenderer {
    /// Create a renderer, resolving the label font
    pub fn new(config: RenderConfig) -> Result<Self> {
        let font = font::resolve_font(config.font_path.as_deref())?;
        Self::with_font(config, font)
    }

    /// Create a renderer with an explicit font, or none for unlabelled output
    pub fn with_font(config: RenderConfig, font: Option<FontVec>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, font })
    }

    #[must_use]
    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Render one record over `source_image` into `result_dir`
    ///
    /// Returns without touching the source image if the output already exists.
    pub fn render_record(
        &self,
        record: &ImageAttentionRecord,
        source_image: &Path,
        result_dir: &Path,
    ) -> Result<RenderOutcome> {
        let out = output_path(source_image, result_dir);
        if out.exists() {
            debug!("Already rendered: {}", out.display());
            return Ok(RenderOutcome::AlreadyRendered(out));
        }

        record.validate()?;
        let source = image::open(source_image)?.to_rgb8();
        let figure = self.compose(record, &source);

        fs::create_dir_all(result_dir)?;
        figure.save(&out)?;
        Ok(RenderOutcome::Rendered(out))
    }

    /// Lay out one panel per step in a fixed-column grid under a score header
    #[must_use]
    pub fn compose(&self, record: &ImageAttentionRecord, source: &RgbImage) -> RgbImage {
        let cfg = &self.config;
        let steps = record.steps.len();
        let cols = cfg.columns.min(steps).max(1) as u32;
        let rows = steps.div_ceil(cfg.columns) as u32;

        let (src_w, src_h) = source.dimensions();
        let scale = cfg.panel_width as f32 / src_w.max(1) as f32;
        let panel_w = cfg.panel_width;
        let panel_h = ((src_h as f32 * scale).round() as u32).max(1);
        let scaled = imageops::resize(source, panel_w, panel_h, imageops::FilterType::Triangle);

        let cell_h = cfg.title_height + panel_h;
        let width = cols * panel_w + (cols + 1) * cfg.margin;
        let height = cfg.header_height + rows * cell_h + (rows + 1) * cfg.margin;
        let mut canvas = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));

        let title_scale = PxScale::from(cfg.font_size);
        if let Some(font) = &self.font {
            let header = format_header(&record.score, &cfg.score_keys);
            let (tw, th) = text_size(title_scale, font, &header);
            let x = width.saturating_sub(tw) / 2;
            let y = cfg.header_height.saturating_sub(th) / 2;
            draw_text_mut(&mut canvas, Rgb([0, 0, 0]), x as i32, y as i32, title_scale, font, &header);
        }

        for (i, step) in record.steps.iter().enumerate() {
            let row = i as u32 / cols;
            let col = i as u32 % cols;
            let x = cfg.margin + col * (panel_w + cfg.margin);
            let y = cfg.header_height + cfg.margin + row * (cell_h + cfg.margin);

            if let Some(font) = &self.font {
                let title = panel_title(&step.caption);
                let (tw, th) = text_size(title_scale, font, &title);
                let tx = x + panel_w.saturating_sub(tw) / 2;
                let ty = y + cfg.title_height.saturating_sub(th) / 2;
                draw_text_mut(&mut canvas, Rgb([0, 0, 0]), tx as i32, ty as i32, title_scale, font, &title);
            }

            let mut panel = scaled.clone();
            if let Some(attentions) = &step.attentions {
                visualization::draw_step_regions(
                    &mut panel,
                    &record.boxes,
                    attentions,
                    scale,
                    cfg,
                    self.font.as_ref(),
                );
            }
            imageops::overlay(
                &mut canvas,
                &panel,
                i64::from(x),
                i64::from(y + cfg.title_height),
            );
        }

        canvas
    }

    /// Render every record whose source image can be located
    ///
    /// Missing images and per-image failures are logged and counted, never fatal.
    pub fn render_dataset(
        &self,
        records: &BTreeMap<String, ImageAttentionRecord>,
        image_root: &Path,
        result_dir: &Path,
        locator: &ImageLocator,
    ) -> Result<RenderSummary> {
        fs::create_dir_all(result_dir)?;
        let total = records.len();
        let mut summary = RenderSummary {
            total,
            ..RenderSummary::default()
        };

        for (count, (image_id, record)) in records.iter().enumerate() {
            let count = count + 1;
            let Some(image_path) = locator.locate(image_root, image_id) else {
                info!("{count:5}/{total} : Image file with id {image_id} not found.");
                summary.missing_image += 1;
                continue;
            };

            info!("{count:5}/{total} : {}", image_path.display());
            match self.render_record(record, &image_path, result_dir) {
                Ok(RenderOutcome::Rendered(_)) => summary.rendered += 1,
                Ok(RenderOutcome::AlreadyRendered(_)) => summary.already_rendered += 1,
                Err(e) => {
                    warn!("Failed to render image {}: {}", image_id, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Rendered {} of {} ({} already present, {} missing, {} failed)",
            summary.rendered, total, summary.already_rendered, summary.missing_image, summary.failed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(json: &str) -> ScoreSet {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_render_config_default() {
        let config = RenderConfig::default();
        assert_eq!(config.top_n, 3);
        assert_eq!(config.columns, 4);
        assert_eq!(config.score_keys[3], "Bleu_4");
    }

    #[test]
    fn test_zero_columns_rejected() {
        let config = RenderConfig {
            columns: 0,
            ..RenderConfig::default()
        };
        assert!(AttentionRenderer::with_font(config, None).is_err());
    }

    #[test]
    fn test_output_path_uses_png_extension() {
        let out = output_path(
            Path::new("/data/val2014/COCO_val2014_000000000042.jpg"),
            Path::new("results"),
        );
        assert_eq!(out, PathBuf::from("results/COCO_val2014_000000000042.png"));
    }

    #[test]
    fn test_format_header_selected_keys() {
        let score = scores(r#"{"Bleu_1": 0.8, "Bleu_2": 0.614, "CIDEr": 1.2}"#);
        let keys = RenderConfig::default().score_keys;
        assert_eq!(format_header(&score, &keys), "Bleu_1 0.80  Bleu_2 0.61");
    }

    #[test]
    fn test_format_header_falls_back_to_all_scores() {
        let score = scores(r#"{"METEOR": 0.25, "CIDEr": 1.2}"#);
        let keys = RenderConfig::default().score_keys;
        assert_eq!(format_header(&score, &keys), "CIDEr 1.20  METEOR 0.25");
        assert_eq!(format_header(&ScoreSet::default(), &keys), "");
    }
}
