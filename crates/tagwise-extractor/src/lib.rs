//! Tagwise Extractor - Trainable information extraction engine
//!
//! Named entity recognition with a semi-Markov Viterbi tagger, binary
//! relation detection between entity mentions and document
//! categorization, all built on a shared pretrained word feature extractor.
//!
//! ```no_run
//! use tagwise_extractor::NamedEntityExtractor;
//!
//! let ner = NamedEntityExtractor::load("ner_model.dat")?;
//! for entity in ner.extract_entities("Davis King works for MIT.")? {
//!     println!("{} [{}] {:.3}", entity.text, entity.label, entity.score);
//! }
//! # Ok::<(), tagwise_core::TagwiseError>(())
//! ```

use std::ops::Range;

use serde::Serialize;

use tagwise_core::{EntityMention, Result, TagVocabulary, Token};

pub mod categorizer;
pub mod conll;
pub mod features;
pub mod hashing;
pub mod learn;
pub mod metrics;
pub mod ner;
pub mod persist;
pub mod relation;
pub mod segment;
pub mod sparse;
pub mod trainer;
pub mod viterbi;

pub use categorizer::{CategorizerTrainer, TextCategorizer};
pub use conll::{parse_conll_file, parse_conll_str};
pub use features::{FeatureVector, WordFeatureExtractor};
pub use learn::TrainingSummary;
pub use metrics::{
    evaluate_binary_relation_detector, evaluate_named_entity_recognizer, LabelMetrics,
    NerEvaluation, RelationMetrics,
};
pub use ner::{NamedEntityExtractor, SequenceTagger};
pub use relation::{
    detect_relations, extract_binary_relation, BinaryRelation, BinaryRelationDetector,
    BinaryRelationTrainer,
};
pub use trainer::{Annotation, NerTrainer, TrainingInstance};

/// An entity found in raw text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedEntity {
    pub text: String,
    pub label: String,
    /// Byte offsets into the source text
    pub start: usize,
    pub end: usize,
    /// Token range the mention covers
    pub tokens: Range<usize>,
    pub score: f64,
}

/// A relation between two mentions of one sentence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedRelation {
    pub relation_type: String,
    /// First argument, as a token range
    pub arg1: Range<usize>,
    pub arg2: Range<usize>,
    pub score: f64,
}

/// Anything that finds entity mentions in a token sequence
pub trait EntityTagger: Send + Sync {
    fn tag(&self, tokens: &[Token]) -> Result<Vec<EntityMention>>;

    fn tag_vocabulary(&self) -> &TagVocabulary;
}

/// Anything that scores an extracted relation; positive means it holds
pub trait RelationScorer: Send + Sync {
    fn relation_type(&self) -> &str;

    fn score(&self, relation: &BinaryRelation) -> Result<f64>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use tagwise_core::{tokens_from_words, Token};

    use crate::features::WordFeatureExtractor;
    use crate::hashing::hash_str;

    const SAMPLE_WORDS: &[&str] = &[
        "my", "name", "is", "davis", "king", "and", "i", "work", "for", "mit", ".", "the",
        "other", "day", "at", "saw", "brian", "smith", "from", "cmu", "john", "lives", "in",
        "boston", "paris", "born", "acme", "corp", "a", "company",
    ];

    /// Small deterministic extractor with 8-dimensional vectors
    pub fn sample_extractor() -> Arc<WordFeatureExtractor> {
        let vectors = SAMPLE_WORDS.iter().map(|w| {
            let v = (0..8u64)
                .map(|i| (hash_str(w, i) % 2001) as f32 / 1000.0 - 1.0)
                .collect::<Vec<f32>>();
            (w.to_string(), v)
        });
        Arc::new(WordFeatureExtractor::from_word_vectors(vectors).expect("sample vectors"))
    }

    pub fn words(words: &[&str]) -> Vec<Token> {
        tokens_from_words(words)
    }
}
