//! Per-step panel drawing
//!
//! Draws the top attended regions of one decoding step over a scaled copy of
//! the source image, with the attention weight as a percentage label.

use crate::RenderConfig;
use ab_glyph::{FontVec, PxScale};
use caption_attention_common::RegionBox;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

/// Box colors by attention rank: red, green, blue, cyan, magenta, yellow, black, white
const PALETTE: [Rgb<u8>; 8] = [
    Rgb([255, 0, 0]),
    Rgb([0, 128, 0]),
    Rgb([0, 0, 255]),
    Rgb([0, 191, 191]),
    Rgb([191, 0, 191]),
    Rgb([191, 191, 0]),
    Rgb([0, 0, 0]),
    Rgb([255, 255, 255]),
];

const LABEL_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const LABEL_BG: Rgb<u8> = Rgb([255, 255, 255]);

/// Color of the box drawn for attention rank `rank` (0 = most attended)
#[inline]
#[must_use]
pub const fn rank_color(rank: usize) -> Rgb<u8> {
    PALETTE[rank % PALETTE.len()]
}

/// Indices of the `n` highest weights, descending
///
/// Equal weights keep their original index order.
#[must_use]
pub fn top_n_regions(weights: &[f32], n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..weights.len()).collect();
    order.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]));
    order.truncate(n);
    order
}

/// Attention weight as an integer percentage
#[inline]
#[must_use]
pub fn weight_label(weight: f32) -> i64 {
    (f64::from(weight) * 100.0).round() as i64
}

/// Short panel title: the last word of the step caption, "." once it ends a sentence
#[must_use]
pub fn panel_title(step_caption: &str) -> String {
    match step_caption.split_whitespace().last() {
        Some(word) if word.ends_with('.') => ".".to_string(),
        Some(word) => word.to_string(),
        None => String::new(),
    }
}

/// Draw `text` with an alpha-blended background box behind it
#[allow(clippy::too_many_arguments)]
pub(crate) fn draw_label(
    img: &mut RgbImage,
    font: &FontVec,
    scale: PxScale,
    x: i32,
    y: i32,
    text: &str,
    color: Rgb<u8>,
    bg_alpha: f32,
) {
    let (tw, th) = text_size(scale, font, text);
    let (width, height) = img.dimensions();
    let x0 = x.max(0) as u32;
    let y0 = y.max(0) as u32;

    // Fill background rectangle manually
    for py in y0..(y0 + th + 2).min(height) {
        for px in x0..(x0 + tw + 2).min(width) {
            let p = img.get_pixel_mut(px, py);
            for c in 0..3 {
                let blended =
                    f32::from(p.0[c]) * (1.0 - bg_alpha) + f32::from(LABEL_BG.0[c]) * bg_alpha;
                p.0[c] = blended.round() as u8;
            }
        }
    }

    draw_text_mut(img, color, x0 as i32 + 1, y0 as i32 + 1, scale, font, text);
}

/// Scale a region box onto the panel, clamped to its bounds
fn panel_rect(region: &RegionBox, scale: f32, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let x = ((region.left * scale) as i32).max(0) as u32;
    let y = ((region.top * scale) as i32).max(0) as u32;
    let w = (region.width() * scale) as u32;
    let h = (region.height() * scale) as u32;

    let w = w.min(width.saturating_sub(x));
    let h = h.min(height.saturating_sub(y));
    (w > 0 && h > 0).then_some((x, y, w, h))
}

/// Draw the top-N attended regions of one step onto `panel`
///
/// `scale` maps source-image pixels to panel pixels. Returns the ranked
/// region indices that were drawn.
pub fn draw_step_regions(
    panel: &mut RgbImage,
    regions: &[RegionBox],
    attentions: &[f32],
    scale: f32,
    config: &RenderConfig,
    font: Option<&FontVec>,
) -> Vec<usize> {
    let (width, height) = panel.dimensions();
    let font_scale = PxScale::from(config.font_size * 0.75);
    let ranked: Vec<usize> = top_n_regions(attentions, config.top_n)
        .into_iter()
        .filter(|&idx| idx < regions.len())
        .collect();

    for (rank, &idx) in ranked.iter().enumerate() {
        let Some((x, y, w, h)) = panel_rect(&regions[idx], scale, width, height) else {
            continue;
        };
        let color = rank_color(rank);

        // Draw bounding box with line thickness
        for t in 0..config.line_thickness {
            let inner_w = w.saturating_sub(2 * t);
            let inner_h = h.saturating_sub(2 * t);
            if inner_w > 0 && inner_h > 0 {
                let rect = Rect::at((x + t) as i32, (y + t) as i32).of_size(inner_w, inner_h);
                draw_hollow_rect_mut(panel, rect, color);
            }
        }

        if let Some(font) = font {
            let text = weight_label(attentions[idx]).to_string();
            let (_, th) = text_size(font_scale, font, &text);
            let text_y = if y < th + 4 { y + 2 } else { y - th - 4 };
            draw_label(panel, font, font_scale, x as i32 + 2, text_y as i32, &text, LABEL_COLOR, 0.5);
        }
    }

    ranked
}
