//! Binary relation extraction
//!
//! A relation between two entity mentions is described once by
//! [`extract_binary_relation`] and can then be scored by any number of
//! [`BinaryRelationDetector`]s. The description is order-sensitive: when
//! the first argument comes after the second, every hashed feature uses a
//! different seed.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tagwise_core::{
    check_span, spans_overlap, EngineConfig, EntityMention, Result, TagwiseError, Token,
    TrainingConfig,
};

use crate::features::WordFeatureExtractor;
use crate::hashing::{bucket, combine, hash_str, sign};
use crate::learn::{train_online, OnlineObjective};
use crate::persist::{self, ArtifactKind};
use crate::sparse::SparseVector;
use crate::{ExtractedRelation, RelationScorer};

/// Seed offset for arguments given in reverse textual order
const REVERSED_SEED: u64 = 100_000;
const NEAR_WINDOW: usize = 2;
const FAR_WINDOW: usize = 5;

// ============================================================================
// Relation Features
// ============================================================================

/// Features of one ordered pair of mentions in a sentence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryRelation {
    /// Mean word vector of each argument, unit length, concatenated
    dense: Vec<f32>,
    /// Hashed n-gram and context keys
    keys: Vec<u64>,
    extractor_fingerprint: u64,
}

impl BinaryRelation {
    pub fn extractor_fingerprint(&self) -> u64 {
        self.extractor_fingerprint
    }

    /// Length of each argument's dense block
    pub fn word_dimensions(&self) -> usize {
        self.dense.len() / 2
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }
}

fn unit_mean(extractor: &WordFeatureExtractor, tokens: &[Token]) -> Array1<f32> {
    let mut mean = Array1::<f32>::zeros(extractor.num_dimensions());
    for token in tokens {
        mean += &extractor.word_vector(&token.text);
    }
    let norm = mean.dot(&mean).sqrt();
    if norm > 0.0 {
        mean /= norm;
    }
    mean
}

fn region<'a>(tokens: &'a [Token], range: &Range<usize>) -> &'a [Token] {
    if range.start < range.end && range.end <= tokens.len() {
        &tokens[range.clone()]
    } else {
        &[]
    }
}

/// 1, 2 and 3-grams of a token region
fn push_ngrams(keys: &mut Vec<u64>, tokens: &[Token], seed: u64) {
    let hashes: Vec<u64> = tokens.iter().map(|t| hash_str(&t.text, seed)).collect();
    for (i, &h) in hashes.iter().enumerate() {
        keys.push(h);
        if i >= 1 {
            keys.push(combine(h, hashes[i - 1]));
        }
        if i >= 2 {
            keys.push(combine(combine(h, hashes[i - 1]), hashes[i - 2]));
        }
    }
}

/// Hash of a whole region as one unit
fn region_hash(tokens: &[Token], seed: u64) -> u64 {
    tokens
        .iter()
        .fold(seed, |h, t| combine(h, hash_str(&t.text, seed)))
}

/// Describe the relation from `arg1` to `arg2`
///
/// Both arguments must be non-empty token ranges inside `tokens`.
pub fn extract_binary_relation(
    extractor: &WordFeatureExtractor,
    tokens: &[Token],
    arg1: Range<usize>,
    arg2: Range<usize>,
) -> Result<BinaryRelation> {
    check_span(&arg1, tokens.len())?;
    check_span(&arg2, tokens.len())?;

    let mut dense = unit_mean(extractor, &tokens[arg1.clone()]).to_vec();
    dense.extend(unit_mean(extractor, &tokens[arg2.clone()]).iter());

    let (first, second, mut seed) = if arg1.start > arg2.start {
        (arg2, arg1, REVERSED_SEED)
    } else {
        (arg1, arg2, 0)
    };

    let n = tokens.len();
    let before_near = first.start.saturating_sub(NEAR_WINDOW)..first.start;
    let before_far = first.start.saturating_sub(FAR_WINDOW)..first.start;
    let between = first.end.min(second.end)..first.start.max(second.start);
    let after_near = second.end..(second.end + NEAR_WINDOW).min(n);
    let after_far = second.end..(second.end + FAR_WINDOW).min(n);

    let mut keys = Vec::new();
    for range in [&before_near, &before_far, &between, &after_near, &after_far] {
        push_ngrams(&mut keys, region(tokens, range), seed);
        seed += 1;
    }

    let h1 = region_hash(region(tokens, &before_near), seed);
    let h2 = region_hash(region(tokens, &between), seed);
    let h3 = region_hash(region(tokens, &after_near), seed);
    keys.push(combine(combine(h1, h2), 0));
    keys.push(combine(combine(0, h2), 0));
    keys.push(combine(combine(0, h2), h3));
    keys.push(combine(combine(h1, h2), h3));

    Ok(BinaryRelation {
        dense,
        keys,
        extractor_fingerprint: extractor.fingerprint(),
    })
}

// ============================================================================
// Detector
// ============================================================================

/// Linear classifier for one relation type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryRelationDetector {
    relation_type: String,
    extractor_fingerprint: u64,
    hash_dimensions: usize,
    word_dimensions: usize,
    weights: Array1<f64>,
}

/// Layout: both dense blocks, then the hashed keys, then a bias
fn relation_dimension(word_dimensions: usize, hash_dimensions: usize) -> usize {
    2 * word_dimensions + hash_dimensions + 1
}

fn relation_features(relation: &BinaryRelation, hash_dimensions: usize) -> SparseVector {
    let offset = relation.dense.len();
    let mut features = SparseVector::with_capacity(offset + relation.keys.len() + 1);
    features.extend_dense(0, Array1::from(relation.dense.clone()).view());
    for &key in &relation.keys {
        features.push((offset + bucket(key, hash_dimensions) as usize) as u32, sign(key));
    }
    features.push((offset + hash_dimensions) as u32, 1.0);
    features.finalize()
}

impl BinaryRelationDetector {
    pub fn relation_type(&self) -> &str {
        &self.relation_type
    }

    pub fn extractor_fingerprint(&self) -> u64 {
        self.extractor_fingerprint
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    /// Score `relation`; positive means the relation holds
    ///
    /// Fails with `IncompatibleModel` if the relation was extracted with a
    /// different word feature extractor.
    pub fn classify(&self, relation: &BinaryRelation) -> Result<f64> {
        if relation.extractor_fingerprint != self.extractor_fingerprint {
            return Err(TagwiseError::IncompatibleModel(format!(
                "'{}' detector was trained with feature extractor {:016x}, relation uses {:016x}",
                self.relation_type, self.extractor_fingerprint, relation.extractor_fingerprint
            )));
        }
        if relation.word_dimensions() != self.word_dimensions {
            return Err(TagwiseError::IncompatibleModel(format!(
                "detector expects {} word dimensions, relation has {}",
                self.word_dimensions,
                relation.word_dimensions()
            )));
        }
        Ok(relation_features(relation, self.hash_dimensions).dot(&self.weights, 0))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        persist::write_artifact(path, ArtifactKind::BinaryRelationDetector, self)?;
        info!(
            "Saved '{}' relation detector to {}",
            self.relation_type,
            path.display()
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let detector: Self = persist::read_artifact(path, ArtifactKind::BinaryRelationDetector)?;
        let expected = relation_dimension(detector.word_dimensions, detector.hash_dimensions);
        if detector.weights.len() != expected || detector.hash_dimensions == 0 {
            return Err(TagwiseError::model_load(
                path,
                format!(
                    "detector has {} weights, expected {}",
                    detector.weights.len(),
                    expected
                ),
            ));
        }
        if detector.weights.iter().any(|w| !w.is_finite()) {
            return Err(TagwiseError::model_load(path, "detector weights are not finite"));
        }
        debug!("Loaded '{}' relation detector", detector.relation_type);
        Ok(detector)
    }
}

impl RelationScorer for BinaryRelationDetector {
    fn relation_type(&self) -> &str {
        &self.relation_type
    }

    fn score(&self, relation: &BinaryRelation) -> Result<f64> {
        self.classify(relation)
    }
}

// ============================================================================
// Trainer
// ============================================================================

struct Example {
    features: SparseVector,
    label: f64,
    weight: f64,
}

struct HingeObjective {
    dimension: usize,
}

impl OnlineObjective for HingeObjective {
    type Instance = Example;

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn update(&self, weights: &mut Array1<f64>, example: &Example, learning_rate: f64) -> bool {
        if example.label * example.features.dot(weights, 0) >= 1.0 {
            return false;
        }
        example
            .features
            .add_to(weights, 0, learning_rate * example.label * example.weight);
        true
    }

    fn is_mistake(&self, weights: &Array1<f64>, example: &Example) -> bool {
        example.label * example.features.dot(weights, 0) <= 0.0
    }
}

/// Collects positive and negative examples of one relation type
pub struct BinaryRelationTrainer {
    relation_type: String,
    extractor: Arc<WordFeatureExtractor>,
    positives: Vec<BinaryRelation>,
    negatives: Vec<BinaryRelation>,
    config: EngineConfig,
    thread_count: usize,
}

impl BinaryRelationTrainer {
    pub fn new(relation_type: impl Into<String>, extractor: Arc<WordFeatureExtractor>) -> Self {
        let config = EngineConfig::default();
        Self {
            relation_type: relation_type.into(),
            extractor,
            positives: Vec::new(),
            negatives: Vec::new(),
            thread_count: config.training.thread_count,
            config,
        }
    }

    /// Fails with `Config` if `config` does not validate
    pub fn with_config(mut self, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        self.thread_count = config.training.thread_count;
        self.config = config;
        Ok(self)
    }

    pub fn relation_type(&self) -> &str {
        &self.relation_type
    }

    pub fn num_positive_examples(&self) -> usize {
        self.positives.len()
    }

    pub fn num_negative_examples(&self) -> usize {
        self.negatives.len()
    }

    pub fn set_num_threads(&mut self, thread_count: usize) {
        self.thread_count = thread_count.max(1);
    }

    pub fn num_threads(&self) -> usize {
        self.thread_count
    }

    fn example(&self, tokens: &[Token], arg1: Range<usize>, arg2: Range<usize>) -> Result<BinaryRelation> {
        check_span(&arg1, tokens.len())?;
        check_span(&arg2, tokens.len())?;
        if spans_overlap(&arg1, &arg2) {
            return Err(TagwiseError::OverlappingAnnotation {
                existing: arg1,
                added: arg2,
            });
        }
        extract_binary_relation(&self.extractor, tokens, arg1, arg2)
    }

    /// Record that the relation holds from `arg1` to `arg2`
    pub fn add_positive_binary_relation(
        &mut self,
        tokens: &[Token],
        arg1: Range<usize>,
        arg2: Range<usize>,
    ) -> Result<()> {
        let relation = self.example(tokens, arg1, arg2)?;
        self.positives.push(relation);
        Ok(())
    }

    /// Record that the relation does not hold from `arg1` to `arg2`
    pub fn add_negative_binary_relation(
        &mut self,
        tokens: &[Token],
        arg1: Range<usize>,
        arg2: Range<usize>,
    ) -> Result<()> {
        let relation = self.example(tokens, arg1, arg2)?;
        self.negatives.push(relation);
        Ok(())
    }

    /// Train a detector; needs at least one positive and one negative example
    pub fn train(&self, thread_count: usize) -> Result<BinaryRelationDetector> {
        if self.positives.is_empty() || self.negatives.is_empty() {
            return Err(TagwiseError::EmptyTrainingSet(format!(
                "'{}' needs positive and negative examples, got {} and {}",
                self.relation_type,
                self.positives.len(),
                self.negatives.len()
            )));
        }

        let hash_dimensions = self.config.relation.hash_dimensions;
        let word_dimensions = self.extractor.num_dimensions();
        let total = (self.positives.len() + self.negatives.len()) as f64;
        let positive_weight = total / (2.0 * self.positives.len() as f64);
        let negative_weight = total / (2.0 * self.negatives.len() as f64);

        // Interleave the classes so every shard sees both
        let mut examples = Vec::with_capacity(total as usize);
        let mut pos = self.positives.iter();
        let mut neg = self.negatives.iter();
        loop {
            let p = pos.next();
            let n = neg.next();
            if p.is_none() && n.is_none() {
                break;
            }
            if let Some(r) = p {
                examples.push(Example {
                    features: relation_features(r, hash_dimensions),
                    label: 1.0,
                    weight: positive_weight,
                });
            }
            if let Some(r) = n {
                examples.push(Example {
                    features: relation_features(r, hash_dimensions),
                    label: -1.0,
                    weight: negative_weight,
                });
            }
        }

        info!(
            "Training '{}' relation detector: {} positive, {} negative",
            self.relation_type,
            self.positives.len(),
            self.negatives.len()
        );

        let training = TrainingConfig {
            max_epochs: self.config.relation.max_epochs,
            ..self.config.training.clone()
        };
        let objective = HingeObjective {
            dimension: relation_dimension(word_dimensions, hash_dimensions),
        };
        let (weights, _) = train_online(&objective, &examples, &training, thread_count)?;

        Ok(BinaryRelationDetector {
            relation_type: self.relation_type.clone(),
            extractor_fingerprint: self.extractor.fingerprint(),
            hash_dimensions,
            word_dimensions,
            weights,
        })
    }
}

// ============================================================================
// Relation Scan
// ============================================================================

/// Score neighbouring mention pairs, in both orders, against `detectors`
///
/// Mentions are taken in textual order; only relations with a positive
/// score are returned.
pub fn detect_relations<D: RelationScorer>(
    extractor: &WordFeatureExtractor,
    tokens: &[Token],
    mentions: &[EntityMention],
    detectors: &[D],
) -> Result<Vec<ExtractedRelation>> {
    let mut ordered: Vec<&EntityMention> = mentions.iter().collect();
    ordered.sort_by_key(|m| (m.start, m.end));

    let mut found = Vec::new();
    for pair in ordered.windows(2) {
        for (a, b) in [(pair[0], pair[1]), (pair[1], pair[0])] {
            let relation = extract_binary_relation(extractor, tokens, a.range(), b.range())?;
            for detector in detectors {
                let score = detector.score(&relation)?;
                if score > 0.0 {
                    found.push(ExtractedRelation {
                        relation_type: detector.relation_type().to_string(),
                        arg1: a.range(),
                        arg2: b.range(),
                        score,
                    });
                }
            }
        }
    }
    Ok(found)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_extractor, words};

    fn sentence() -> Vec<Token> {
        words(&["John", "lives", "in", "Boston", "and", "works", "for", "Acme", "Corp", "."])
    }

    #[test]
    fn test_relation_is_order_sensitive() {
        let fe = sample_extractor();
        let tokens = sentence();
        let forward = extract_binary_relation(&fe, &tokens, 0..1, 3..4).unwrap();
        let backward = extract_binary_relation(&fe, &tokens, 3..4, 0..1).unwrap();
        assert_ne!(forward, backward);
        assert_eq!(forward.word_dimensions(), fe.num_dimensions());
        assert_eq!(forward.extractor_fingerprint(), fe.fingerprint());
    }

    #[test]
    fn test_relation_rejects_bad_spans() {
        let fe = sample_extractor();
        let tokens = sentence();
        assert!(matches!(
            extract_binary_relation(&fe, &tokens, 0..1, 9..11),
            Err(TagwiseError::InvalidSpan { .. })
        ));
        assert!(matches!(
            extract_binary_relation(&fe, &tokens, 2..2, 3..4),
            Err(TagwiseError::InvalidSpan { .. })
        ));
    }

    #[test]
    fn test_trainer_needs_both_classes() {
        let mut trainer = BinaryRelationTrainer::new("lives_in", sample_extractor());
        trainer
            .add_positive_binary_relation(&sentence(), 0..1, 3..4)
            .unwrap();
        assert!(matches!(
            trainer.train(1),
            Err(TagwiseError::EmptyTrainingSet(_))
        ));
    }

    #[test]
    fn test_trainer_rejects_overlapping_arguments() {
        let mut trainer = BinaryRelationTrainer::new("lives_in", sample_extractor());
        assert!(matches!(
            trainer.add_positive_binary_relation(&sentence(), 0..2, 1..3),
            Err(TagwiseError::OverlappingAnnotation { .. })
        ));
        assert_eq!(trainer.num_positive_examples(), 0);
    }

    #[test]
    fn test_detector_separates_training_pairs() {
        let tokens = sentence();
        let mut trainer = BinaryRelationTrainer::new("lives_in", sample_extractor());
        trainer.add_positive_binary_relation(&tokens, 0..1, 3..4).unwrap();
        trainer.add_negative_binary_relation(&tokens, 3..4, 0..1).unwrap();
        trainer.add_negative_binary_relation(&tokens, 0..1, 7..9).unwrap();
        let detector = trainer.train(2).unwrap();
        assert_eq!(detector.relation_type(), "lives_in");

        let fe = sample_extractor();
        let positive = extract_binary_relation(&fe, &tokens, 0..1, 3..4).unwrap();
        let reversed = extract_binary_relation(&fe, &tokens, 3..4, 0..1).unwrap();
        assert!(detector.classify(&positive).unwrap() > 0.0);
        assert!(detector.classify(&reversed).unwrap() < 0.0);
    }

    #[test]
    fn test_detector_rejects_foreign_extractor() {
        let tokens = sentence();
        let mut trainer = BinaryRelationTrainer::new("lives_in", sample_extractor());
        trainer.add_positive_binary_relation(&tokens, 0..1, 3..4).unwrap();
        trainer.add_negative_binary_relation(&tokens, 3..4, 0..1).unwrap();
        let detector = trainer.train(1).unwrap();

        let other = WordFeatureExtractor::from_word_vectors(vec![("john", vec![1.0; 8])]).unwrap();
        let relation = extract_binary_relation(&other, &tokens, 0..1, 3..4).unwrap();
        assert!(matches!(
            detector.classify(&relation),
            Err(TagwiseError::IncompatibleModel(_))
        ));
    }

    #[test]
    fn test_detector_round_trip() {
        let tokens = sentence();
        let mut trainer = BinaryRelationTrainer::new("works_for", sample_extractor());
        trainer.add_positive_binary_relation(&tokens, 0..1, 7..9).unwrap();
        trainer.add_negative_binary_relation(&tokens, 0..1, 3..4).unwrap();
        let detector = trainer.train(1).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("works_for.rel");
        detector.save(&path).unwrap();
        assert_eq!(BinaryRelationDetector::load(&path).unwrap(), detector);
    }

    #[test]
    fn test_detect_relations_scans_neighbours() {
        let fe = sample_extractor();
        let tokens = sentence();
        let mut trainer = BinaryRelationTrainer::new("lives_in", fe.clone());
        trainer.add_positive_binary_relation(&tokens, 0..1, 3..4).unwrap();
        trainer.add_negative_binary_relation(&tokens, 3..4, 0..1).unwrap();
        trainer.add_negative_binary_relation(&tokens, 3..4, 7..9).unwrap();
        trainer.add_negative_binary_relation(&tokens, 7..9, 3..4).unwrap();
        let detector = trainer.train(1).unwrap();

        let mentions = vec![
            EntityMention::new(7, 9, 1, 1.0),
            EntityMention::new(0, 1, 0, 1.0),
            EntityMention::new(3, 4, 2, 1.0),
        ];
        let found = detect_relations(&fe, &tokens, &mentions, &[detector]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].relation_type, "lives_in");
        assert_eq!((found[0].arg1.clone(), found[0].arg2.clone()), (0..1, 3..4));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.relation.hash_dimensions = 0;
        assert!(matches!(
            BinaryRelationTrainer::new("works_for", sample_extractor()).with_config(config),
            Err(TagwiseError::Config(_))
        ));
    }
}
