//! Label font loading
//!
//! Text is optional: without a usable font, panels are still drawn, only
//! titles and weight labels are left out.

use crate::RenderError;
use ab_glyph::FontVec;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Common system locations of a sans-serif TrueType font
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Load a font file
pub fn load_font(path: &Path) -> Result<FontVec, RenderError> {
    let data = std::fs::read(path)?;
    FontVec::try_from_vec(data)
        .map_err(|e| RenderError::Font(format!("{}: {e}", path.display())))
}

/// Load the configured font, or the first loadable system font
///
/// An explicitly configured font that fails to load is an error.
pub fn resolve_font(configured: Option<&Path>) -> Result<Option<FontVec>, RenderError> {
    if let Some(path) = configured {
        return load_font(path).map(Some);
    }

    for candidate in SYSTEM_FONTS.iter().map(PathBuf::from) {
        if !candidate.is_file() {
            continue;
        }
        match load_font(&candidate) {
            Ok(font) => {
                debug!("Using font {}", candidate.display());
                return Ok(Some(font));
            }
            Err(e) => debug!("Skipping font {}: {}", candidate.display(), e),
        }
    }

    warn!("No font found, rendering without titles and labels (use --font to set one)");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_font_must_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ttf");
        std::fs::write(&path, b"not a font").unwrap();

        assert!(matches!(
            resolve_font(Some(&path)),
            Err(RenderError::Font(_))
        ));
        assert!(resolve_font(Some(&dir.path().join("missing.ttf"))).is_err());
    }
}
