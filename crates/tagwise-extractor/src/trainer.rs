//! NER training
//!
//! [`TrainingInstance`] holds one annotated sentence. [`NerTrainer`]
//! accumulates instances and fits a [`SequenceTagger`] with a
//! loss-augmented structured perceptron: decode each sentence with a margin
//! added to every wrong segment, and when the result differs from the gold
//! segmentation, move the weights toward the gold features and away from
//! the predicted ones. `beta` sets how missed entities are weighed against
//! false alarms in that margin.

use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use ndarray::Array1;
use tracing::{debug, info};

use tagwise_core::{
    check_span, spans_overlap, ConfigError, EngineConfig, Result, TagVocabulary, TagwiseError,
    Token,
};

use crate::features::{FeatureVector, WordFeatureExtractor};
use crate::learn::{train_online, OnlineObjective, TrainingSummary};
use crate::ner::{save_tagger_separate, NamedEntityExtractor, SequenceTagger};
use crate::segment::{SegmentFeaturizer, SpanTable};
use crate::viterbi::{accumulate, gold_segmentation, viterbi, Lattice, Segment, WeightLayout};

// ============================================================================
// Training Instance
// ============================================================================

/// A labelled entity span inside a training instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub range: Range<usize>,
    pub label: String,
}

/// One sentence with its entity annotations
///
/// Annotations are append-only and never overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingInstance {
    tokens: Vec<Token>,
    annotations: Vec<Annotation>,
}

impl TrainingInstance {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            annotations: Vec::new(),
        }
    }

    /// Build an instance from `(start, length, label)` triples
    pub fn with_entities<S: Into<String>>(
        tokens: Vec<Token>,
        entities: impl IntoIterator<Item = (usize, usize, S)>,
    ) -> Result<Self> {
        let mut instance = Self::new(tokens);
        for (start, length, label) in entities {
            instance.add_entity(start, length, label)?;
        }
        Ok(instance)
    }

    /// Annotate `length` tokens starting at `start` with `label`
    ///
    /// Fails with `InvalidSpan` for an empty or out-of-range span and with
    /// `OverlappingAnnotation` if it overlaps an existing annotation.
    pub fn add_entity(&mut self, start: usize, length: usize, label: impl Into<String>) -> Result<()> {
        let range = start..start.saturating_add(length);
        check_span(&range, self.tokens.len())?;
        if let Some(existing) = self.overlapping(&range) {
            return Err(TagwiseError::OverlappingAnnotation {
                existing: existing.range.clone(),
                added: range,
            });
        }
        self.annotations.push(Annotation {
            range,
            label: label.into(),
        });
        Ok(())
    }

    /// Builder form of [`add_entity`](Self::add_entity)
    pub fn with_entity(mut self, start: usize, length: usize, label: impl Into<String>) -> Result<Self> {
        self.add_entity(start, length, label)?;
        Ok(self)
    }

    /// Whether `range` overlaps any existing annotation
    pub fn overlaps_any_entity(&self, range: Range<usize>) -> bool {
        self.overlapping(&range).is_some()
    }

    fn overlapping(&self, range: &Range<usize>) -> Option<&Annotation> {
        self.annotations
            .iter()
            .find(|a| spans_overlap(&a.range, range))
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    pub fn num_entities(&self) -> usize {
        self.annotations.len()
    }

    /// Re-check every invariant; instances built through the public API
    /// always pass
    fn validate(&self) -> Result<()> {
        for (i, a) in self.annotations.iter().enumerate() {
            check_span(&a.range, self.tokens.len())?;
            if let Some(b) = self.annotations[..i]
                .iter()
                .find(|b| spans_overlap(&a.range, &b.range))
            {
                return Err(TagwiseError::OverlappingAnnotation {
                    existing: b.range.clone(),
                    added: a.range.clone(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Objective
// ============================================================================

struct Sentence {
    feats: Vec<FeatureVector>,
    gold: Vec<Segment>,
}

struct NerObjective {
    layout: WeightLayout,
    featurizer: SegmentFeaturizer,
    margin: f64,
    beta: f64,
}

impl NerObjective {
    fn table(&self, sentence: &Sentence) -> SpanTable {
        SpanTable::build(&self.featurizer, &sentence.feats, self.layout.max_length)
    }
}

impl OnlineObjective for NerObjective {
    type Instance = Sentence;

    fn dimension(&self) -> usize {
        self.layout.dimension()
    }

    fn update(&self, weights: &mut Array1<f64>, sentence: &Sentence, learning_rate: f64) -> bool {
        if sentence.feats.is_empty() {
            return false;
        }
        let table = self.table(sentence);
        let mut lattice = Lattice::build(self.layout, weights, &table);
        lattice.add_loss(&sentence.gold, self.margin, self.beta);

        let predicted = viterbi(self.layout, weights, &lattice);
        if predicted == sentence.gold {
            return false;
        }
        accumulate(self.layout, &sentence.gold, &table, weights, learning_rate);
        accumulate(self.layout, &predicted, &table, weights, -learning_rate);
        true
    }

    fn is_mistake(&self, weights: &Array1<f64>, sentence: &Sentence) -> bool {
        if sentence.feats.is_empty() {
            return false;
        }
        let table = self.table(sentence);
        let lattice = Lattice::build(self.layout, weights, &table);
        viterbi(self.layout, weights, &lattice) != sentence.gold
    }
}

// ============================================================================
// NER Trainer
// ============================================================================

/// Accumulates training instances and fits a named entity extractor
pub struct NerTrainer {
    extractor: Arc<WordFeatureExtractor>,
    instances: Vec<TrainingInstance>,
    config: EngineConfig,
    thread_count: usize,
}

impl NerTrainer {
    pub fn new(extractor: Arc<WordFeatureExtractor>) -> Self {
        let config = EngineConfig::default();
        let thread_count = config.training.thread_count;
        Self {
            extractor,
            instances: Vec::new(),
            config,
            thread_count,
        }
    }

    /// Use the tagger and training settings from `config`
    ///
    /// Fails with `Config` if `config` does not validate.
    pub fn with_config(mut self, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        self.thread_count = config.training.thread_count;
        self.config = config;
        Ok(self)
    }

    /// Set the precision/recall trade-off; must be non-negative
    ///
    /// Below 1 the trainer works harder to avoid false alarms, above 1 to
    /// avoid missed entities.
    pub fn set_beta(&mut self, beta: f64) -> Result<()> {
        if !(beta >= 0.0 && beta.is_finite()) {
            return Err(ConfigError::InvalidValue {
                key: "training.beta".to_string(),
                value: beta.to_string(),
            }
            .into());
        }
        self.config.training.beta = beta;
        Ok(())
    }

    pub fn beta(&self) -> f64 {
        self.config.training.beta
    }

    pub fn set_num_threads(&mut self, thread_count: usize) {
        self.thread_count = thread_count.max(1);
    }

    pub fn num_threads(&self) -> usize {
        self.thread_count
    }

    /// Add an annotated sentence
    pub fn add(&mut self, instance: TrainingInstance) -> Result<()> {
        instance.validate()?;
        self.instances.push(instance);
        Ok(())
    }

    /// Number of accumulated instances
    pub fn size(&self) -> usize {
        self.instances.len()
    }

    /// Train with `thread_count` workers
    pub fn train(&self, thread_count: usize) -> Result<NamedEntityExtractor> {
        let (tagger, _) = self.train_tagger(thread_count)?;
        NamedEntityExtractor::new(tagger, Arc::clone(&self.extractor))
    }

    /// Train with the configured worker count
    pub fn train_default(&self) -> Result<NamedEntityExtractor> {
        self.train(self.thread_count)
    }

    /// Train and save the tagger without its feature extractor
    ///
    /// The file can only be loaded with
    /// [`NamedEntityExtractor::load_with_extractor`] and an extractor whose
    /// fingerprint matches the one used here. Nothing is written if
    /// training fails.
    pub fn train_separate_models(&self, thread_count: usize, path: impl AsRef<Path>) -> Result<SequenceTagger> {
        let (tagger, _) = self.train_tagger(thread_count)?;
        save_tagger_separate(&tagger, path.as_ref())?;
        Ok(tagger)
    }

    /// Train and report what the learner did
    pub fn train_with_summary(&self, thread_count: usize) -> Result<(NamedEntityExtractor, TrainingSummary)> {
        let (tagger, summary) = self.train_tagger(thread_count)?;
        Ok((NamedEntityExtractor::new(tagger, Arc::clone(&self.extractor))?, summary))
    }

    fn train_tagger(&self, thread_count: usize) -> Result<(SequenceTagger, TrainingSummary)> {
        if self.instances.is_empty() {
            return Err(TagwiseError::EmptyTrainingSet(
                "the NER trainer has no training instances".to_string(),
            ));
        }

        let mut tags = TagVocabulary::new();
        let mut max_length = self.config.tagger.max_segment_length;
        for instance in &self.instances {
            for a in instance.annotations() {
                tags.get_or_insert(&a.label);
                max_length = max_length.max(a.range.len());
            }
        }
        if max_length > self.config.tagger.max_segment_length {
            debug!(
                "Raising max segment length from {} to {} to cover the longest annotation",
                self.config.tagger.max_segment_length, max_length
            );
        }

        let radius = self.config.tagger.context_radius;
        let featurizer = SegmentFeaturizer::new(
            self.config.tagger.hash_dimensions,
            self.extractor.num_dimensions(),
        );
        let layout = WeightLayout::new(tags.len(), featurizer.dimension(), max_length);

        let sentences: Vec<Sentence> = self
            .instances
            .iter()
            .map(|instance| {
                let mut entities: Vec<Segment> = instance
                    .annotations()
                    .iter()
                    .map(|a| Segment {
                        start: a.range.start,
                        len: a.range.len(),
                        label: tags.index_of(&a.label).unwrap_or_default(),
                    })
                    .collect();
                entities.sort();
                Sentence {
                    feats: self.extractor.extract_with_radius(instance.tokens(), radius),
                    gold: gold_segmentation(layout, instance.num_tokens(), &entities),
                }
            })
            .collect();

        info!(
            "Training NER model: {} instances, {} tags {:?}",
            sentences.len(),
            tags.len(),
            tags.labels()
        );

        let objective = NerObjective {
            layout,
            featurizer,
            margin: self.config.training.margin,
            beta: self.config.training.beta,
        };
        let (weights, summary) =
            train_online(&objective, &sentences, &self.config.training, thread_count)?;

        let tagger = SequenceTagger::from_parts(
            tags,
            weights,
            featurizer,
            max_length,
            radius,
            self.extractor.fingerprint(),
        );
        Ok((tagger, summary))
    }
}

// ============================================================================
// Tests
// ============================================================================
