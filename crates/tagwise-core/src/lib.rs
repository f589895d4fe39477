//! Tagwise Core - Shared data model, errors, and tokenizer
//!
//! This crate defines the types every other tagwise crate speaks:
//! - Tokens and token sequences with stable byte offsets
//! - Entity mentions over token ranges
//! - The tag vocabulary that numbers entity labels
//! - The error taxonomy shared by inference and training
//! - Engine configuration

pub mod config;
pub mod tokenizer;

pub use config::{
    CategorizerConfig, ConfigError, EngineConfig, LoggingConfig, RelationConfig, TaggerConfig,
    TrainingConfig,
};
pub use tokenizer::{tokenize, tokens_from_words};

use std::collections::HashMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised by tagwise operations
#[derive(Error, Debug)]
pub enum TagwiseError {
    #[error("Failed to load model from {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("Incompatible model: {0}")]
    IncompatibleModel(String),

    #[error("Overlapping annotation: [{}, {}) overlaps [{}, {})", .existing.start, .existing.end, .added.start, .added.end)]
    OverlappingAnnotation {
        existing: Range<usize>,
        added: Range<usize>,
    },

    #[error("Empty training set: {0}")]
    EmptyTrainingSet(String),

    #[error("Invalid span [{start}, {end}) for a sequence of {len} tokens")]
    InvalidSpan { start: usize, end: usize, len: usize },

    #[error("Model was saved without its feature extractor; load it with a matching extractor")]
    FeatureExtractorRequired,

    #[error("Numerical error during training: {0}")]
    Numerical(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TagwiseError {
    /// Build a model load error for `path`
    pub fn model_load(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        Self::ModelLoad {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TagwiseError>;

// ============================================================================
// Tokens
// ============================================================================

/// A token produced by the tokenizer
///
/// `start` and `end` are byte offsets into the source text. `text` is
/// normally `source[start..end]`; the only exception is a token split at a
/// typographic apostrophe, whose text is normalized to begin with `'`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Token {
    pub fn new(start: usize, end: usize, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

// ============================================================================
// Entity Mentions
// ============================================================================

/// A tagged span of tokens
///
/// `start..end` is a half-open token range, `tag` indexes the model's
/// [`TagVocabulary`], and `score` is the tagger's confidence margin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    pub start: usize,
    pub end: usize,
    pub tag: usize,
    pub score: f64,
}

impl EntityMention {
    pub fn new(start: usize, end: usize, tag: usize, score: f64) -> Self {
        Self {
            start,
            end,
            tag,
            score,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Check that `range` is a non-empty span inside a sequence of `len` tokens
pub fn check_span(range: &Range<usize>, len: usize) -> Result<()> {
    if range.start >= range.end || range.end > len {
        return Err(TagwiseError::InvalidSpan {
            start: range.start,
            end: range.end,
            len,
        });
    }
    Ok(())
}

/// True when two half-open ranges share at least one index
pub fn spans_overlap(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start.max(b.start) < a.end.min(b.end)
}

// ============================================================================
// Tag Vocabulary
// ============================================================================

/// Ordered set of entity labels with stable indices
///
/// Labels are numbered in the order they are first inserted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TagVocabulary {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl TagVocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the index of `label`, inserting it if unseen
    pub fn get_or_insert(&mut self, label: &str) -> usize {
        if let Some(&id) = self.index.get(label) {
            return id;
        }
        let id = self.labels.len();
        self.labels.push(label.to_string());
        self.index.insert(label.to_string(), id);
        id
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn name(&self, id: usize) -> Option<&str> {
        self.labels.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.labels.iter().enumerate().map(|(i, l)| (i, l.as_str()))
    }
}

impl From<Vec<String>> for TagVocabulary {
    fn from(labels: Vec<String>) -> Self {
        let mut vocab = Self::new();
        for label in &labels {
            vocab.get_or_insert(label);
        }
        vocab
    }
}

impl From<TagVocabulary> for Vec<String> {
    fn from(vocab: TagVocabulary) -> Self {
        vocab.labels
    }
}

// ============================================================================
// Tests
// ============================================================================
