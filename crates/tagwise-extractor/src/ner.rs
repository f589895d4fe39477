//! Named Entity Recognition (NER) module
//!
//! [`SequenceTagger`] is the learned model: a tag vocabulary plus the flat
//! weight vector scored by the semi-Markov decoder. It tags per-token
//! feature vectors. [`NamedEntityExtractor`] pairs a tagger with the word
//! feature extractor it was trained against, so it can tag raw tokens and
//! text.

use std::path::Path;
use std::sync::Arc;

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::info;

use tagwise_core::{tokenize, EntityMention, Result, TagVocabulary, TagwiseError, Token};

use crate::features::{FeatureVector, WordFeatureExtractor};
use crate::persist::{self, ArtifactKind, ExtractorSlot, ExtractorSlotRef, WithExtractor, WithExtractorRef};
use crate::relation::{extract_binary_relation, BinaryRelation};
use crate::segment::{SegmentFeaturizer, SpanTable};
use crate::viterbi::{viterbi, Lattice, WeightLayout};
use crate::{EntityTagger, ExtractedEntity};

// ============================================================================
// Sequence Tagger
// ============================================================================

/// Learned entity tagger over per-token feature vectors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceTagger {
    tags: TagVocabulary,
    weights: Array1<f64>,
    hash_dimensions: usize,
    word_dimensions: usize,
    max_segment_length: usize,
    context_radius: usize,
    extractor_fingerprint: u64,
}

impl SequenceTagger {
    pub(crate) fn from_parts(
        tags: TagVocabulary,
        weights: Array1<f64>,
        featurizer: SegmentFeaturizer,
        max_segment_length: usize,
        context_radius: usize,
        extractor_fingerprint: u64,
    ) -> Self {
        Self {
            tags,
            weights,
            hash_dimensions: featurizer.hash_dimensions(),
            word_dimensions: featurizer.word_dimensions(),
            max_segment_length,
            context_radius,
            extractor_fingerprint,
        }
    }

    pub(crate) fn featurizer(&self) -> SegmentFeaturizer {
        SegmentFeaturizer::new(self.hash_dimensions, self.word_dimensions)
    }

    pub(crate) fn layout(&self) -> WeightLayout {
        WeightLayout::new(
            self.tags.len(),
            self.featurizer().dimension(),
            self.max_segment_length,
        )
    }

    pub fn tag_vocabulary(&self) -> &TagVocabulary {
        &self.tags
    }

    pub fn weights(&self) -> &Array1<f64> {
        &self.weights
    }

    /// Dense dimensionality expected of every feature vector
    pub fn word_dimensions(&self) -> usize {
        self.word_dimensions
    }

    pub fn max_segment_length(&self) -> usize {
        self.max_segment_length
    }

    pub fn context_radius(&self) -> usize {
        self.context_radius
    }

    /// Fingerprint of the word feature extractor this tagger was trained with
    pub fn extractor_fingerprint(&self) -> u64 {
        self.extractor_fingerprint
    }

    /// Best segmentation of one sentence into entity mentions
    ///
    /// Mentions come back ordered, non-overlapping and inside the sentence.
    /// Each mention's score is its margin over the best competing label for
    /// the same span; no threshold is applied.
    pub fn tag(&self, feats: &[FeatureVector]) -> Result<Vec<EntityMention>> {
        if let Some(bad) = feats.iter().find(|f| f.dimension() != self.word_dimensions) {
            return Err(TagwiseError::IncompatibleModel(format!(
                "feature vectors have {} dimensions but the tagger expects {}",
                bad.dimension(),
                self.word_dimensions
            )));
        }

        let layout = self.layout();
        let table = SpanTable::build(&self.featurizer(), feats, self.max_segment_length);
        let lattice = Lattice::build(layout, &self.weights, &table);

        Ok(viterbi(layout, &self.weights, &lattice)
            .into_iter()
            .filter(|seg| seg.label != layout.outside())
            .map(|seg| EntityMention::new(seg.start, seg.end(), seg.label, lattice.confidence(&seg)))
            .collect())
    }

    /// Check that the weight vector matches the declared shape
    fn verify(&self) -> std::result::Result<(), String> {
        let expected = self.layout().dimension();
        if self.weights.len() != expected {
            return Err(format!(
                "weight vector has {} entries, expected {}",
                self.weights.len(),
                expected
            ));
        }
        if self.max_segment_length == 0 {
            return Err("max segment length is zero".to_string());
        }
        if self.hash_dimensions == 0 {
            return Err("hash dimensions are zero".to_string());
        }
        Ok(())
    }

    /// Load just the tagger from a bundled or separate model file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stored: WithExtractor<SequenceTagger> =
            persist::read_artifact(path, ArtifactKind::NamedEntityExtractor)?;
        stored
            .model
            .verify()
            .map_err(|reason| TagwiseError::model_load(path, reason))?;
        Ok(stored.model)
    }
}

// ============================================================================
// Named Entity Extractor
// ============================================================================

/// A sequence tagger paired with its word feature extractor
#[derive(Debug, Clone)]
pub struct NamedEntityExtractor {
    tagger: SequenceTagger,
    extractor: Arc<WordFeatureExtractor>,
}

impl NamedEntityExtractor {
    /// Pair `tagger` with `extractor`, which must be the one it was trained with
    pub fn new(tagger: SequenceTagger, extractor: Arc<WordFeatureExtractor>) -> Result<Self> {
        if tagger.extractor_fingerprint != extractor.fingerprint() {
            return Err(TagwiseError::IncompatibleModel(format!(
                "tagger was trained with feature extractor {:016x}, got {:016x}",
                tagger.extractor_fingerprint,
                extractor.fingerprint()
            )));
        }
        if tagger.word_dimensions != extractor.num_dimensions() {
            return Err(TagwiseError::IncompatibleModel(format!(
                "tagger expects {} feature dimensions, extractor produces {}",
                tagger.word_dimensions,
                extractor.num_dimensions()
            )));
        }
        Ok(Self { tagger, extractor })
    }

    pub fn tagger(&self) -> &SequenceTagger {
        &self.tagger
    }

    pub fn feature_extractor(&self) -> &Arc<WordFeatureExtractor> {
        &self.extractor
    }

    pub fn tag_vocabulary(&self) -> &TagVocabulary {
        &self.tagger.tags
    }

    /// Label of a mention's tag index
    pub fn tag_name(&self, tag: usize) -> Option<&str> {
        self.tagger.tags.name(tag)
    }

    pub fn possible_tags(&self) -> &[String] {
        self.tagger.tags.labels()
    }

    /// Per-token features as the tagger expects them
    pub fn features(&self, tokens: &[Token]) -> Vec<FeatureVector> {
        self.extractor
            .extract_with_radius(tokens, self.tagger.context_radius)
    }

    /// Tag a token sequence
    pub fn tag(&self, tokens: &[Token]) -> Result<Vec<EntityMention>> {
        self.tagger.tag(&self.features(tokens))
    }

    /// Tokenize and tag `text`, resolving mentions to labels and byte spans
    pub fn extract_entities(&self, text: &str) -> Result<Vec<ExtractedEntity>> {
        let tokens = tokenize(text);
        let mentions = self.tag(&tokens)?;

        Ok(mentions
            .into_iter()
            .map(|m| {
                let start = tokens[m.start].start;
                let end = tokens[m.end - 1].end;
                ExtractedEntity {
                    text: text.get(start..end).unwrap_or_default().to_string(),
                    label: self.tag_name(m.tag).unwrap_or_default().to_string(),
                    start,
                    end,
                    tokens: m.range(),
                    score: m.score,
                }
            })
            .collect())
    }

    /// Pairwise relation features for the ordered mention pair `(a, b)`
    pub fn extract_relation(
        &self,
        tokens: &[Token],
        a: &EntityMention,
        b: &EntityMention,
    ) -> Result<BinaryRelation> {
        extract_binary_relation(&self.extractor, tokens, a.range(), b.range())
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Save with the word feature extractor bundled into the file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let stored = WithExtractorRef {
            extractor: ExtractorSlotRef::Bundled(&self.extractor),
            model: &self.tagger,
        };
        persist::write_artifact(path, ArtifactKind::NamedEntityExtractor, &stored)?;
        info!("Saved bundled NER model to {}", path.display());
        Ok(())
    }

    /// Save only the tagger; loading it requires the same feature extractor
    pub fn save_separate(&self, path: impl AsRef<Path>) -> Result<()> {
        save_tagger_separate(&self.tagger, path.as_ref())
    }

    /// Load a bundled model file
    ///
    /// Fails with `FeatureExtractorRequired` for a model saved separately.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stored: WithExtractor<SequenceTagger> =
            persist::read_artifact(path, ArtifactKind::NamedEntityExtractor)?;
        stored
            .model
            .verify()
            .map_err(|reason| TagwiseError::model_load(path, reason))?;

        match stored.extractor {
            ExtractorSlot::Bundled(extractor) => {
                extractor
                    .verify()
                    .map_err(|reason| TagwiseError::model_load(path, reason))?;
                info!("Loaded bundled NER model from {}", path.display());
                Self::new(stored.model, Arc::new(extractor))
            }
            ExtractorSlot::External { .. } => Err(TagwiseError::FeatureExtractorRequired),
        }
    }

    /// Load a model file, using `extractor` for feature extraction
    ///
    /// Works for both bundled and separate files; the extractor must match
    /// the one the model was trained with.
    pub fn load_with_extractor(
        path: impl AsRef<Path>,
        extractor: Arc<WordFeatureExtractor>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let tagger = SequenceTagger::load(path)?;
        info!("Loaded NER model from {}", path.display());
        Self::new(tagger, extractor)
    }
}

pub(crate) fn save_tagger_separate(tagger: &SequenceTagger, path: &Path) -> Result<()> {
    let stored = WithExtractorRef {
        extractor: ExtractorSlotRef::External {
            fingerprint: tagger.extractor_fingerprint,
        },
        model: tagger,
    };
    persist::write_artifact(path, ArtifactKind::NamedEntityExtractor, &stored)?;
    info!("Saved separate NER model to {}", path.display());
    Ok(())
}

impl EntityTagger for NamedEntityExtractor {
    fn tag(&self, tokens: &[Token]) -> Result<Vec<EntityMention>> {
        NamedEntityExtractor::tag(self, tokens)
    }

    fn tag_vocabulary(&self) -> &TagVocabulary {
        NamedEntityExtractor::tag_vocabulary(self)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_extractor, words};

    fn zero_tagger(extractor: &WordFeatureExtractor) -> SequenceTagger {
        let featurizer = SegmentFeaturizer::new(1 << 8, extractor.num_dimensions());
        let tags = TagVocabulary::from(vec!["person".to_string(), "org".to_string()]);
        let layout = WeightLayout::new(tags.len(), featurizer.dimension(), 3);
        let mut weights = Array1::zeros(layout.dimension());
        // Every tag carries a heavy length penalty, so outside always wins
        for tag in 0..2 {
            for len in 1..=3 {
                weights[layout.length_index(tag, len)] = -5.0;
            }
        }
        SequenceTagger::from_parts(tags, weights, featurizer, 3, 2, extractor.fingerprint())
    }

    #[test]
    fn test_all_outside_when_tags_are_penalized() {
        let extractor = sample_extractor();
        let ner = NamedEntityExtractor::new(zero_tagger(&extractor), extractor).unwrap();
        let mentions = ner.tag(&words(&["I", "work", "for", "MIT"])).unwrap();
        assert!(mentions.is_empty());
        assert!(ner.tag(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_dimension_mismatch_is_incompatible() {
        let extractor = sample_extractor();
        let tagger = zero_tagger(&extractor);
        let small = WordFeatureExtractor::from_word_vectors(vec![("a", vec![1.0])]).unwrap();
        let feats = small.extract(&words(&["a", "b"]));

        assert!(matches!(
            tagger.tag(&feats),
            Err(TagwiseError::IncompatibleModel(_))
        ));
        assert!(matches!(
            NamedEntityExtractor::new(tagger, Arc::new(small)),
            Err(TagwiseError::IncompatibleModel(_))
        ));
    }

    #[test]
    fn test_separate_file_needs_extractor() {
        let extractor = sample_extractor();
        let ner = NamedEntityExtractor::new(zero_tagger(&extractor), extractor.clone()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let separate = dir.path().join("separate.bin");
        let bundled = dir.path().join("bundled.bin");
        ner.save_separate(&separate).unwrap();
        ner.save(&bundled).unwrap();

        assert!(matches!(
            NamedEntityExtractor::load(&separate),
            Err(TagwiseError::FeatureExtractorRequired)
        ));
        assert!(NamedEntityExtractor::load_with_extractor(&separate, extractor).is_ok());
        assert!(NamedEntityExtractor::load(&bundled).is_ok());
        assert!(std::fs::metadata(&separate).unwrap().len() < std::fs::metadata(&bundled).unwrap().len());
    }

    #[test]
    fn test_wrong_extractor_rejected_at_load() {
        let extractor = sample_extractor();
        let ner = NamedEntityExtractor::new(zero_tagger(&extractor), extractor).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("separate.bin");
        ner.save_separate(&path).unwrap();

        let other = Arc::new(
            WordFeatureExtractor::from_word_vectors(vec![("zzz", vec![0.0; 8])]).unwrap(),
        );
        assert!(matches!(
            NamedEntityExtractor::load_with_extractor(&path, other),
            Err(TagwiseError::IncompatibleModel(_))
        ));
    }

    #[test]
    fn test_zero_hash_dimensions_rejected_at_load() {
        let extractor = sample_extractor();
        let featurizer = SegmentFeaturizer::new(0, extractor.num_dimensions());
        let layout = WeightLayout::new(2, featurizer.dimension(), 3);
        let tagger = SequenceTagger {
            hash_dimensions: 0,
            weights: Array1::zeros(layout.dimension()),
            ..zero_tagger(&extractor)
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("separate.bin");
        save_tagger_separate(&tagger, &path).unwrap();
        assert!(matches!(
            SequenceTagger::load(&path),
            Err(TagwiseError::ModelLoad { ref reason, .. }) if reason.contains("hash dimensions")
        ));
    }

    #[test]
    fn test_from_parts_takes_featurizer_shape() {
        let extractor = sample_extractor();
        let tagger = zero_tagger(&extractor);
        assert_eq!(tagger.featurizer(), SegmentFeaturizer::new(1 << 8, extractor.num_dimensions()));
    }
}
