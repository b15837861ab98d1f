//! Vocabulary loading and index-sequence translation
//!
//! Turns a decoder token buffer into the caption string the captioner would
//! print: first token titlecased, no space before "." or ",", quotes escaped,
//! stop at the first ".".

use ndarray::ArrayView1;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Errors raised while loading or applying a vocabulary
#[derive(Error, Debug)]
pub enum VocabularyError {
    #[error("Failed to read vocabulary {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Vocabulary file is empty: {0}")]
    Empty(String),

    #[error("Token index {index} outside vocabulary of {len} words (vocabulary/model mismatch)")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("Token buffer holds non-integral index {0} (vocabulary/model mismatch)")]
    InvalidIndex(f32),
}

/// Index -> word table, read-only after loading
#[derive(Debug, Clone)]
pub struct Vocabulary {
    words: Vec<String>,
}

impl Vocabulary {
    /// Load a vocabulary with one token per line; line number is the index
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, VocabularyError> {
        let path = path.as_ref();
        info!("loading vocab file: {}", path.display());

        let contents = fs::read_to_string(path).map_err(|source| VocabularyError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let vocab = Self::from_words(contents.lines().map(str::trim));
        if vocab.is_empty() {
            return Err(VocabularyError::Empty(path.display().to_string()));
        }

        info!("vocabulary size: {}", vocab.len());
        Ok(vocab)
    }

    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[must_use]
    pub fn word(&self, index: usize) -> Option<&str> {
        self.words.get(index).map(String::as_str)
    }

    /// Look up a raw buffer value, rejecting anything that is not a valid index
    fn lookup(&self, raw: f32) -> Result<&str, VocabularyError> {
        if !raw.is_finite() || raw.fract() != 0.0 {
            return Err(VocabularyError::InvalidIndex(raw));
        }
        let index = raw as i64;
        usize::try_from(index)
            .ok()
            .and_then(|i| self.word(i))
            .ok_or(VocabularyError::IndexOutOfRange {
                index,
                len: self.len(),
            })
    }

    /// Translate a token buffer into a caption string
    ///
    /// Entries after the first "." are never read, so trailing garbage in a
    /// fixed-length buffer is harmless.
    pub fn translate(&self, buffer: ArrayView1<'_, f32>) -> Result<String, VocabularyError> {
        let mut caption = String::new();

        for (w, &raw) in buffer.iter().enumerate() {
            let word = self.lookup(raw)?;
            let word = if w == 0 {
                titlecase(word)
            } else {
                word.to_string()
            };

            if w > 0 && word != "." && word != "," {
                caption.push(' ');
            }
            caption.push_str(&word.replace('"', "\\\""));

            if caption.ends_with('.') {
                break;
            }
        }

        Ok(caption)
    }
}

/// Uppercase the first letter of every alphabetic run and lowercase the rest
fn titlecase(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut prev_cased = false;
    for c in word.chars() {
        if prev_cased {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        prev_cased = c.is_alphabetic();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn vocab() -> Vocabulary {
        let mut words: Vec<String> = (0..13).map(|i| format!("w{i}")).collect();
        words[0] = "<eos>".to_string();
        words[1] = "a".to_string();
        words[2] = "red".to_string();
        words[3] = ",".to_string();
        words[4] = "\"hi\"".to_string();
        words[5] = "man".to_string();
        words[7] = ".".to_string();
        words[12] = "riding".to_string();
        Vocabulary::from_words(words)
    }

    #[test]
    fn test_capitalizes_and_stops_at_period() {
        let caption = vocab().translate(arr1(&[5.0, 12.0, 7.0]).view()).unwrap();
        assert_eq!(caption, "Man riding.");
        assert!(caption.ends_with('.'));
    }

    #[test]
    fn test_trailing_entries_are_ignored() {
        // 999.0 would be out of range but is never reached
        let caption = vocab()
            .translate(arr1(&[1.0, 2.0, 7.0, 999.0, -4.5]).view())
            .unwrap();
        assert_eq!(caption, "A red.");
    }

    #[test]
    fn test_no_space_before_comma() {
        let caption = vocab().translate(arr1(&[1.0, 5.0, 3.0, 2.0]).view()).unwrap();
        assert_eq!(caption, "A man, red");
    }

    #[test]
    fn test_quotes_are_escaped() {
        let caption = vocab().translate(arr1(&[1.0, 4.0]).view()).unwrap();
        assert_eq!(caption, "A \\\"hi\\\"");
    }

    #[test]
    fn test_out_of_range_index_is_an_error() {
        let err = vocab().translate(arr1(&[1.0, 40.0]).view()).unwrap_err();
        assert!(matches!(
            err,
            VocabularyError::IndexOutOfRange { index: 40, len: 13 }
        ));
    }

    #[test]
    fn test_fractional_index_is_an_error() {
        let err = vocab().translate(arr1(&[1.5]).view()).unwrap_err();
        assert!(matches!(err, VocabularyError::InvalidIndex(_)));
    }

    #[test]
    fn test_empty_buffer() {
        let empty: [f32; 0] = [];
        assert_eq!(vocab().translate(arr1(&empty).view()).unwrap(), "");
    }

    #[test]
    fn test_titlecase() {
        assert_eq!(titlecase("t-shirt"), "T-Shirt");
        assert_eq!(titlecase("RED"), "Red");
        assert_eq!(titlecase("."), ".");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        fs::write(&path, "<eos>\n a \nred\n").unwrap();

        let vocab = Vocabulary::from_file(&path).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.word(1), Some("a"));
    }

    #[test]
    fn test_empty_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.txt");
        fs::write(&path, "").unwrap();
        assert!(matches!(
            Vocabulary::from_file(&path),
            Err(VocabularyError::Empty(_))
        ));
    }
}
