//! Source image lookup by dataset naming convention

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Resolves `<root>/<split><year>/<prefix>_<split><year>_<id:012>.jpg`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageLocator {
    /// Dataset splits tried in order
    pub splits: Vec<String>,
    pub year: String,
    pub prefix: String,
}

impl Default for ImageLocator {
    fn default() -> Self {
        Self {
            splits: vec!["train".to_string(), "val".to_string()],
            year: "2014".to_string(),
            prefix: "COCO".to_string(),
        }
    }
}

impl ImageLocator {
    /// Candidate paths for an image id, one per split; empty for non-numeric ids
    #[must_use]
    pub fn candidates(&self, image_root: &Path, image_id: &str) -> Vec<PathBuf> {
        let Ok(id) = image_id.trim().parse::<u64>() else {
            return Vec::new();
        };
        self.splits
            .iter()
            .map(|split| {
                let folder = format!("{split}{}", self.year);
                let name = format!("{}_{folder}_{id:012}.jpg", self.prefix);
                image_root.join(folder).join(name)
            })
            .collect()
    }

    /// First existing candidate
    #[must_use]
    pub fn locate(&self, image_root: &Path, image_id: &str) -> Option<PathBuf> {
        self.candidates(image_root, image_id)
            .into_iter()
            .find(|p| p.is_file())
    }
}
