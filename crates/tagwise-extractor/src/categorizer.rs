//! Document categorization
//!
//! A flat multiclass perceptron over a bag of hashed words and stems plus
//! the document's mean word vector.

use std::path::Path;
use std::sync::Arc;

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::info;

use tagwise_core::{EngineConfig, Result, TagVocabulary, TagwiseError, Token, TrainingConfig};

use crate::features::WordFeatureExtractor;
use crate::hashing::{bucket, hash_str, sign, stem};
use crate::learn::{train_online, OnlineObjective};
use crate::persist::{self, ArtifactKind, ExtractorSlot, ExtractorSlotRef, WithExtractor, WithExtractorRef};
use crate::sparse::SparseVector;

const WORD_SEED: u64 = 0x7e57;
const STEM_SEED: u64 = 0x57e4;

/// Features of a whole document
///
/// Layout: hashed words and stems, the mean word vector, then a bias.
fn document_features(
    extractor: &WordFeatureExtractor,
    tokens: &[Token],
    hash_dimensions: usize,
) -> SparseVector {
    let dims = extractor.num_dimensions();
    let mut features = SparseVector::with_capacity(2 * tokens.len() + dims + 1);
    let mut mean = Array1::<f32>::zeros(dims);

    for token in tokens {
        let word = hash_str(&token.text.to_lowercase(), WORD_SEED);
        let stemmed = hash_str(&stem(&token.text), STEM_SEED);
        features.push(bucket(word, hash_dimensions), sign(word));
        features.push(bucket(stemmed, hash_dimensions), sign(stemmed));
        mean += &extractor.word_vector(&token.text);
    }
    if !tokens.is_empty() {
        mean /= tokens.len() as f32;
    }

    features.extend_dense(hash_dimensions, mean.view());
    features.push((hash_dimensions + dims) as u32, 1.0);
    features.finalize()
}

// ============================================================================
// Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CategorizerModel {
    labels: TagVocabulary,
    /// One block of `class_dimension` weights per label
    weights: Array1<f64>,
    hash_dimensions: usize,
    word_dimensions: usize,
    extractor_fingerprint: u64,
}

impl CategorizerModel {
    fn class_dimension(&self) -> usize {
        self.hash_dimensions + self.word_dimensions + 1
    }

    fn scores(&self, features: &SparseVector) -> Vec<f64> {
        let block = self.class_dimension();
        (0..self.labels.len())
            .map(|c| features.dot(&self.weights, c * block))
            .collect()
    }

    fn verify(&self) -> std::result::Result<(), String> {
        if self.labels.is_empty() {
            return Err("categorizer has no labels".to_string());
        }
        if self.hash_dimensions == 0 {
            return Err("hash dimensions are zero".to_string());
        }
        let expected = self.labels.len() * self.class_dimension();
        if self.weights.len() != expected {
            return Err(format!(
                "weight vector has {} entries, expected {}",
                self.weights.len(),
                expected
            ));
        }
        Ok(())
    }
}

/// Index of the highest score and its margin over the runner-up
///
/// The lowest index wins ties.
fn best_label(scores: &[f64]) -> Option<(usize, f64)> {
    let mut best: Option<usize> = None;
    for (c, &score) in scores.iter().enumerate() {
        if best.map_or(true, |b| score > scores[b]) {
            best = Some(c);
        }
    }
    let best = best?;
    let runner_up = scores
        .iter()
        .enumerate()
        .filter(|&(c, _)| c != best)
        .map(|(_, &s)| s)
        .fold(f64::NEG_INFINITY, f64::max);
    let margin = if runner_up.is_finite() {
        scores[best] - runner_up
    } else {
        scores[best]
    };
    Some((best, margin))
}

/// Assigns one label to a whole document
#[derive(Debug, Clone)]
pub struct TextCategorizer {
    model: CategorizerModel,
    extractor: Arc<WordFeatureExtractor>,
}

impl TextCategorizer {
    fn new(model: CategorizerModel, extractor: Arc<WordFeatureExtractor>) -> Result<Self> {
        if model.extractor_fingerprint != extractor.fingerprint()
            || model.word_dimensions != extractor.num_dimensions()
        {
            return Err(TagwiseError::IncompatibleModel(format!(
                "categorizer was trained with feature extractor {:016x}, got {:016x}",
                model.extractor_fingerprint,
                extractor.fingerprint()
            )));
        }
        Ok(Self { model, extractor })
    }

    pub fn labels(&self) -> &[String] {
        self.model.labels.labels()
    }

    pub fn feature_extractor(&self) -> &Arc<WordFeatureExtractor> {
        &self.extractor
    }

    /// Most likely label and its margin over the next best label
    ///
    /// With a single label the score is that label's raw score.
    pub fn categorize(&self, tokens: &[Token]) -> Result<(String, f64)> {
        let features = document_features(&self.extractor, tokens, self.model.hash_dimensions);
        let scores = self.model.scores(&features);
        let (best, margin) = best_label(&scores)
            .ok_or_else(|| TagwiseError::InvalidInput("categorizer has no labels".to_string()))?;
        let label = self.model.labels.name(best).unwrap_or_default().to_string();
        Ok((label, margin))
    }

    /// Save with the word feature extractor bundled into the file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let stored = WithExtractorRef {
            extractor: ExtractorSlotRef::Bundled(&self.extractor),
            model: &self.model,
        };
        persist::write_artifact(path, ArtifactKind::TextCategorizer, &stored)?;
        info!("Saved bundled categorizer to {}", path.display());
        Ok(())
    }

    /// Save only the model; loading it requires the same feature extractor
    pub fn save_separate(&self, path: impl AsRef<Path>) -> Result<()> {
        save_model_separate(&self.model, path.as_ref())
    }

    fn read(path: &Path) -> Result<WithExtractor<CategorizerModel>> {
        let stored: WithExtractor<CategorizerModel> =
            persist::read_artifact(path, ArtifactKind::TextCategorizer)?;
        stored
            .model
            .verify()
            .map_err(|reason| TagwiseError::model_load(path, reason))?;
        Ok(stored)
    }

    /// Load a bundled categorizer
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stored = Self::read(path)?;
        match stored.extractor {
            ExtractorSlot::Bundled(extractor) => {
                extractor
                    .verify()
                    .map_err(|reason| TagwiseError::model_load(path, reason))?;
                Self::new(stored.model, Arc::new(extractor))
            }
            ExtractorSlot::External { .. } => Err(TagwiseError::FeatureExtractorRequired),
        }
    }

    /// Load a bundled or separate categorizer using `extractor`
    pub fn load_with_extractor(
        path: impl AsRef<Path>,
        extractor: Arc<WordFeatureExtractor>,
    ) -> Result<Self> {
        let stored = Self::read(path.as_ref())?;
        Self::new(stored.model, extractor)
    }
}

fn save_model_separate(model: &CategorizerModel, path: &Path) -> Result<()> {
    let stored = WithExtractorRef {
        extractor: ExtractorSlotRef::External {
            fingerprint: model.extractor_fingerprint,
        },
        model,
    };
    persist::write_artifact(path, ArtifactKind::TextCategorizer, &stored)?;
    info!("Saved separate categorizer to {}", path.display());
    Ok(())
}

// ============================================================================
// Trainer
// ============================================================================

struct Document {
    features: SparseVector,
    label: usize,
}

struct MulticlassObjective {
    classes: usize,
    class_dimension: usize,
    margin: f64,
}

impl MulticlassObjective {
    fn scores(&self, weights: &Array1<f64>, doc: &Document) -> Vec<f64> {
        (0..self.classes)
            .map(|c| doc.features.dot(weights, c * self.class_dimension))
            .collect()
    }
}

impl OnlineObjective for MulticlassObjective {
    type Instance = Document;

    fn dimension(&self) -> usize {
        self.classes * self.class_dimension
    }

    fn update(&self, weights: &mut Array1<f64>, doc: &Document, learning_rate: f64) -> bool {
        let scores = self.scores(weights, doc);
        let rival = scores
            .iter()
            .enumerate()
            .filter(|&(c, _)| c != doc.label)
            .max_by(|a, b| a.1.total_cmp(b.1).then(b.0.cmp(&a.0)));
        let Some((rival, &rival_score)) = rival else {
            return false;
        };
        if scores[doc.label] - rival_score >= self.margin {
            return false;
        }
        doc.features
            .add_to(weights, doc.label * self.class_dimension, learning_rate);
        doc.features
            .add_to(weights, rival * self.class_dimension, -learning_rate);
        true
    }

    fn is_mistake(&self, weights: &Array1<f64>, doc: &Document) -> bool {
        best_label(&self.scores(weights, doc)).map(|(c, _)| c) != Some(doc.label)
    }
}

/// Collects labelled documents and trains a [`TextCategorizer`]
pub struct CategorizerTrainer {
    extractor: Arc<WordFeatureExtractor>,
    documents: Vec<(Vec<Token>, String)>,
    config: EngineConfig,
    thread_count: usize,
}

impl CategorizerTrainer {
    pub fn new(extractor: Arc<WordFeatureExtractor>) -> Self {
        let config = EngineConfig::default();
        Self {
            extractor,
            documents: Vec::new(),
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

    pub fn add(&mut self, tokens: Vec<Token>, label: impl Into<String>) -> Result<()> {
        let label = label.into();
        if label.is_empty() {
            return Err(TagwiseError::InvalidInput(
                "document label must not be empty".to_string(),
            ));
        }
        self.documents.push((tokens, label));
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.documents.len()
    }

    pub fn set_num_threads(&mut self, thread_count: usize) {
        self.thread_count = thread_count.max(1);
    }

    pub fn num_threads(&self) -> usize {
        self.thread_count
    }

    pub fn train(&self, thread_count: usize) -> Result<TextCategorizer> {
        let model = self.train_model(thread_count)?;
        TextCategorizer::new(model, Arc::clone(&self.extractor))
    }

    /// Train and save the model without its feature extractor
    pub fn train_separate_models(&self, thread_count: usize, path: impl AsRef<Path>) -> Result<()> {
        let model = self.train_model(thread_count)?;
        save_model_separate(&model, path.as_ref())
    }

    fn train_model(&self, thread_count: usize) -> Result<CategorizerModel> {
        if self.documents.is_empty() {
            return Err(TagwiseError::EmptyTrainingSet(
                "the categorizer trainer has no documents".to_string(),
            ));
        }

        let hash_dimensions = self.config.categorizer.hash_dimensions;
        let word_dimensions = self.extractor.num_dimensions();
        let mut labels = TagVocabulary::new();
        let documents: Vec<Document> = self
            .documents
            .iter()
            .map(|(tokens, label)| Document {
                features: document_features(&self.extractor, tokens, hash_dimensions),
                label: labels.get_or_insert(label),
            })
            .collect();

        info!(
            "Training categorizer: {} documents, {} labels",
            documents.len(),
            labels.len()
        );

        let objective = MulticlassObjective {
            classes: labels.len(),
            class_dimension: hash_dimensions + word_dimensions + 1,
            margin: self.config.training.margin,
        };
        let training = TrainingConfig {
            max_epochs: self.config.categorizer.max_epochs,
            ..self.config.training.clone()
        };
        let (weights, _) = train_online(&objective, &documents, &training, thread_count)?;

        Ok(CategorizerModel {
            labels,
            weights,
            hash_dimensions,
            word_dimensions,
            extractor_fingerprint: self.extractor.fingerprint(),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
