//! Word Feature Extractor
//!
//! Turns tokens into numeric features. Each token gets a dense word vector
//! built from four blocks:
//!
//! | block        | size                 | content                                   |
//! |--------------|----------------------|-------------------------------------------|
//! | OOV          | 1                    | 1.0 when the word has no embedding        |
//! | embedding    | `embedding_dims`     | pretrained vector, scaled to mean-abs 1   |
//! | morphology   | `morphology_dims`    | hashed character trigrams                 |
//! | shape        | 5                    | caps, all-caps, digit, hyphen, punctuation |
//!
//! plus hashed lexical keys (word, lowercase, stem, affixes, shape pattern)
//! and hashed keys for the neighbouring words inside a context window.

use std::collections::HashMap;
use std::fs::File;
use std::hash::Hasher;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;
use tracing::{debug, info};

use tagwise_core::{Result, TagwiseError, Token};

use crate::hashing::{bucket, combine, hash_str, sign, stem};
use crate::persist::{self, ArtifactKind};

pub const DEFAULT_MORPHOLOGY_DIMENSIONS: usize = 32;
pub const DEFAULT_CONTEXT_RADIUS: usize = 2;
pub const SHAPE_FEATURES: usize = 5;

const MORPH_SEED: u64 = 0x6d6f_7270;
const BOUNDARY_KEY: u64 = 0x0b0b_0b0b;

// Seeds separating the lexical key families of one token
const WORD_SEED: u64 = 1;
const LOWER_SEED: u64 = 2;
const STEM_SEED: u64 = 3;
const PREFIX_SEED: u64 = 4;
const SUFFIX_SEED: u64 = 5;
const SHAPE_SEED: u64 = 6;
const CONTEXT_SEED: u64 = 7;

// ============================================================================
// Feature Vector
// ============================================================================

/// Features of one token in its sentence
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    /// The token's own word vector
    pub word: Array1<f32>,
    /// Hashed lexical keys of the token itself
    pub lexical: Vec<u64>,
    /// Hashed keys of the neighbouring words, tagged with their offset
    pub context_keys: Vec<u64>,
}

impl FeatureVector {
    /// Dense dimensionality, which models check against their own
    pub fn dimension(&self) -> usize {
        self.word.len()
    }
}

// ============================================================================
// Shape helpers
// ============================================================================

pub fn is_capitalized(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase)
}

pub fn is_all_caps(word: &str) -> bool {
    word.chars().any(char::is_alphabetic) && !word.chars().any(char::is_lowercase)
}

pub fn contains_digit(word: &str) -> bool {
    word.chars().any(|c| c.is_ascii_digit())
}

pub fn contains_hyphen(word: &str) -> bool {
    word.contains('-')
}

pub fn is_punctuation(word: &str) -> bool {
    !word.is_empty() && word.chars().all(|c| c.is_ascii_punctuation() || c == '\u{2019}')
}

/// Collapse a word to its character classes, e.g. "McDonald" -> "XxXx"
pub fn shape_pattern(word: &str) -> String {
    let mut pattern = String::new();
    for ch in word.chars() {
        let class = if ch.is_uppercase() {
            'X'
        } else if ch.is_lowercase() {
            'x'
        } else if ch.is_ascii_digit() {
            'd'
        } else {
            ch
        };
        if !pattern.ends_with(class) {
            pattern.push(class);
        }
    }
    pattern
}

fn normalize_digits(word: &str) -> String {
    word.chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect()
}

/// Lexical keys for a single word
pub fn lexical_keys(word: &str) -> Vec<u64> {
    let lower = word.to_lowercase();
    let chars: Vec<char> = lower.chars().collect();
    let prefix: String = chars.iter().take(3).collect();
    let suffix: String = chars[chars.len().saturating_sub(3)..].iter().collect();

    vec![
        hash_str(word, WORD_SEED),
        hash_str(&lower, LOWER_SEED),
        hash_str(&stem(word), STEM_SEED),
        hash_str(&prefix, PREFIX_SEED),
        hash_str(&suffix, SUFFIX_SEED),
        hash_str(&shape_pattern(word), SHAPE_SEED),
    ]
}

// ============================================================================
// Word Feature Extractor
// ============================================================================

/// Pretrained word representation shared by every model of one language
///
/// Immutable once built; share it with `Arc<WordFeatureExtractor>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordFeatureExtractor {
    vocabulary: HashMap<String, usize>,
    embeddings: Array2<f32>,
    morphology_dimensions: usize,
    fingerprint: u64,
}

impl WordFeatureExtractor {
    /// Build from in-memory `(word, vector)` pairs
    ///
    /// All vectors must share one dimensionality. The first occurrence of a
    /// duplicated word wins. The table is rescaled so the mean absolute
    /// entry is 1.
    pub fn from_word_vectors<I, S>(vectors: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<f32>)>,
        S: Into<String>,
    {
        let mut vocabulary = HashMap::new();
        let mut flat = Vec::new();
        let mut dims = None;

        for (word, vector) in vectors {
            let word = word.into();
            let expected = *dims.get_or_insert(vector.len());
            if vector.len() != expected {
                return Err(TagwiseError::InvalidInput(format!(
                    "vector for '{}' has {} dimensions, expected {}",
                    word,
                    vector.len(),
                    expected
                )));
            }
            if vector.iter().any(|v| !v.is_finite()) {
                return Err(TagwiseError::InvalidInput(format!(
                    "vector for '{word}' contains non-finite values"
                )));
            }
            if vocabulary.contains_key(&word) {
                continue;
            }
            vocabulary.insert(word, vocabulary.len());
            flat.extend(vector);
        }

        let dims = dims.unwrap_or(0);
        let mut embeddings = Array2::from_shape_vec((vocabulary.len(), dims), flat)
            .map_err(|e| TagwiseError::InvalidInput(e.to_string()))?;

        let mean_abs = if embeddings.is_empty() {
            0.0
        } else {
            embeddings.mapv(f32::abs).mean().unwrap_or(0.0)
        };
        if mean_abs > 0.0 {
            embeddings /= mean_abs;
        }

        let mut extractor = Self {
            vocabulary,
            embeddings,
            morphology_dimensions: DEFAULT_MORPHOLOGY_DIMENSIONS,
            fingerprint: 0,
        };
        extractor.fingerprint = extractor.compute_fingerprint();

        debug!(
            "Built word feature extractor: {} words, {} dimensions",
            extractor.vocabulary_size(),
            extractor.num_dimensions()
        );
        Ok(extractor)
    }

    /// Read a text vector file: one `word v1 v2 ...` entry per line
    ///
    /// A leading word2vec `count dims` header line is skipped.
    pub fn from_text_vectors(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| TagwiseError::model_load(path, e.to_string()))?;
        let reader = BufReader::new(file);

        let mut vectors = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| TagwiseError::model_load(path, e.to_string()))?;
            let mut fields = line.split_whitespace();
            let Some(word) = fields.next() else {
                continue;
            };
            let values: std::result::Result<Vec<f32>, _> = fields.map(str::parse).collect();
            let values = values.map_err(|e| {
                TagwiseError::model_load(path, format!("line {}: {}", line_no + 1, e))
            })?;

            let is_header = line_no == 0 && values.len() == 1 && word.parse::<usize>().is_ok();
            if is_header || values.is_empty() {
                continue;
            }
            vectors.push((word.to_string(), values));
        }

        if vectors.is_empty() {
            return Err(TagwiseError::model_load(path, "no word vectors found"));
        }

        let extractor = Self::from_word_vectors(vectors)
            .map_err(|e| TagwiseError::model_load(path, e.to_string()))?;
        info!(
            "Loaded {} word vectors from {}",
            extractor.vocabulary_size(),
            path.display()
        );
        Ok(extractor)
    }

    /// Change the number of hashed morphology buckets
    pub fn with_morphology_dimensions(mut self, dimensions: usize) -> Self {
        self.morphology_dimensions = dimensions;
        self.fingerprint = self.compute_fingerprint();
        self
    }

    pub fn vocabulary_size(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn embedding_dimensions(&self) -> usize {
        self.embeddings.ncols()
    }

    pub fn morphology_dimensions(&self) -> usize {
        self.morphology_dimensions
    }

    /// Length of every word vector this extractor produces
    pub fn num_dimensions(&self) -> usize {
        1 + self.embedding_dimensions() + self.morphology_dimensions + SHAPE_FEATURES
    }

    /// Content hash identifying this extractor
    ///
    /// Models trained with one extractor record its fingerprint and refuse
    /// to run against any other.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn contains(&self, word: &str) -> bool {
        self.lookup(word).is_some()
    }

    fn lookup(&self, word: &str) -> Option<usize> {
        let normalized = normalize_digits(word);
        self.vocabulary
            .get(&normalized)
            .or_else(|| self.vocabulary.get(&normalized.to_lowercase()))
            .copied()
    }

    fn compute_fingerprint(&self) -> u64 {
        let mut hasher = SipHasher13::new_with_keys(0x7461_6777, 0x6973_6521);
        hasher.write_u64(self.embedding_dimensions() as u64);
        hasher.write_u64(self.morphology_dimensions as u64);

        let mut words: Vec<(&String, &usize)> = self.vocabulary.iter().collect();
        words.sort();
        for (word, &row) in words {
            hasher.write(word.as_bytes());
            hasher.write_u8(0xff);
            for value in self.embeddings.row(row) {
                hasher.write_u32(value.to_bits());
            }
        }
        hasher.finish()
    }

    /// Dense vector for a single word, independent of context
    pub fn word_vector(&self, word: &str) -> Array1<f32> {
        let embed = self.embedding_dimensions();
        let morph = self.morphology_dimensions;
        let mut vector = Array1::zeros(self.num_dimensions());

        match self.lookup(word) {
            Some(row) => vector
                .slice_mut(s![1..1 + embed])
                .assign(&self.embeddings.row(row)),
            None => vector[0] = 1.0,
        }

        if morph > 0 {
            let padded: Vec<char> = format!("<{}>", word.to_lowercase()).chars().collect();
            let grams: Vec<String> = padded
                .windows(3.min(padded.len()))
                .map(|w| w.iter().collect())
                .collect();
            let scale = 1.0 / (grams.len() as f32).sqrt();
            for gram in &grams {
                let key = hash_str(gram, MORPH_SEED);
                vector[1 + embed + bucket(key, morph) as usize] += sign(key) * scale;
            }
        }

        let shape = 1 + embed + morph;
        let flags = [
            is_capitalized(word),
            is_all_caps(word),
            contains_digit(word),
            contains_hyphen(word),
            is_punctuation(word),
        ];
        for (i, flag) in flags.into_iter().enumerate() {
            if flag {
                vector[shape + i] = 1.0;
            }
        }

        vector
    }

    /// Extract per-token features with the default ±2 context window
    pub fn extract(&self, tokens: &[Token]) -> Vec<FeatureVector> {
        self.extract_with_radius(tokens, DEFAULT_CONTEXT_RADIUS)
    }

    /// Extract per-token features with a `radius`-token window on each side
    pub fn extract_with_radius(&self, tokens: &[Token], radius: usize) -> Vec<FeatureVector> {
        let words: Vec<Array1<f32>> = tokens.iter().map(|t| self.word_vector(&t.text)).collect();
        let neighbour_keys: Vec<u64> = tokens
            .iter()
            .map(|t| hash_str(&t.text.to_lowercase(), CONTEXT_SEED))
            .collect();
        let n = tokens.len();

        (0..n)
            .map(|i| {
                let mut context_keys = Vec::with_capacity(2 * radius);
                for offset in 1..=radius {
                    let left = i.checked_sub(offset).map(|j| neighbour_keys[j]);
                    let right = (i + offset < n).then(|| neighbour_keys[i + offset]);
                    context_keys.push(combine(left.unwrap_or(BOUNDARY_KEY), 256 - offset as u64));
                    context_keys.push(combine(right.unwrap_or(BOUNDARY_KEY), 256 + offset as u64));
                }

                FeatureVector {
                    word: words[i].clone(),
                    lexical: lexical_keys(&tokens[i].text),
                    context_keys,
                }
            })
            .collect()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Save as a standalone extractor file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        persist::write_artifact(path.as_ref(), ArtifactKind::FeatureExtractor, self)?;
        info!("Saved word feature extractor to {}", path.as_ref().display());
        Ok(())
    }

    /// Load a standalone extractor file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extractor: Self = persist::read_artifact(path, ArtifactKind::FeatureExtractor)?;
        extractor.verify().map_err(|reason| TagwiseError::model_load(path, reason))?;
        Ok(extractor)
    }

    /// Check internal consistency after deserialization
    pub(crate) fn verify(&self) -> std::result::Result<(), String> {
        if let Some(&row) = self.vocabulary.values().find(|&&r| r >= self.embeddings.nrows()) {
            return Err(format!("vocabulary row {row} is out of range"));
        }
        if self.compute_fingerprint() != self.fingerprint {
            return Err("feature extractor fingerprint does not match its contents".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
