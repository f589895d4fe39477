//! Quality Metrics module
//!
//! Precision, recall and F1 for entity recognizers and relation detectors,
//! measured against annotated data.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tagwise_core::{Result, TagwiseError};

use crate::relation::{BinaryRelation, BinaryRelationDetector};
use crate::trainer::TrainingInstance;
use crate::EntityTagger;

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn f1(p: f64, r: f64) -> f64 {
    if p + r == 0.0 {
        0.0
    } else {
        2.0 * p * r / (p + r)
    }
}

// ============================================================================
// Entity Metrics
// ============================================================================

/// Match counts for one entity label, or for all labels together
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMetrics {
    /// Predicted mentions with the gold span and label
    pub true_positives: usize,
    /// Predicted mentions with no exact gold counterpart
    pub false_positives: usize,
    /// Gold mentions that were not predicted exactly
    pub false_negatives: usize,
}

impl LabelMetrics {
    /// TP / (TP + FP)
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    /// TP / (TP + FN)
    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1_score(&self) -> f64 {
        f1(self.precision(), self.recall())
    }

    pub fn gold_total(&self) -> usize {
        self.true_positives + self.false_negatives
    }

    pub fn predicted_total(&self) -> usize {
        self.true_positives + self.false_positives
    }

    fn add(&mut self, other: &LabelMetrics) {
        self.true_positives += other.true_positives;
        self.false_positives += other.false_positives;
        self.false_negatives += other.false_negatives;
    }
}

/// Result of evaluating an entity recognizer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NerEvaluation {
    /// Per label, in the model's tag order
    pub per_label: Vec<(String, LabelMetrics)>,
    pub overall: LabelMetrics,
    pub num_sentences: usize,
}

impl NerEvaluation {
    pub fn label(&self, name: &str) -> Option<&LabelMetrics> {
        self.per_label
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, m)| m)
    }

    /// Human-readable summary table
    pub fn report(&self) -> String {
        let mut out = format!(
            "=== Entity Recognition Report ===\n\n\
             Sentences evaluated: {}\n\n\
             {:<16} {:>9} {:>9} {:>9} {:>6} {:>6} {:>6}\n",
            self.num_sentences, "Label", "Precision", "Recall", "F1", "TP", "FP", "FN"
        );
        let rows = self
            .per_label
            .iter()
            .map(|(label, m)| (label.as_str(), m))
            .chain(std::iter::once(("overall", &self.overall)));
        for (label, m) in rows {
            let _ = writeln!(
                out,
                "{:<16} {:>8.1}% {:>8.1}% {:>8.1}% {:>6} {:>6} {:>6}",
                label,
                m.precision() * 100.0,
                m.recall() * 100.0,
                m.f1_score() * 100.0,
                m.true_positives,
                m.false_positives,
                m.false_negatives,
            );
        }
        out
    }
}

/// Tag every instance and compare with its annotations
///
/// A mention counts only when both span and label match exactly. Fails with
/// `InvalidInput` if an annotation uses a label the tagger does not know.
pub fn evaluate_named_entity_recognizer<T: EntityTagger + ?Sized>(
    tagger: &T,
    instances: &[TrainingInstance],
) -> Result<NerEvaluation> {
    let tags = tagger.tag_vocabulary();
    let mut per_label = vec![LabelMetrics::default(); tags.len()];

    for instance in instances {
        let mut gold = HashSet::new();
        for a in instance.annotations() {
            let tag = tags.index_of(&a.label).ok_or_else(|| {
                TagwiseError::InvalidInput(format!(
                    "annotation label '{}' is not known to the model (known: {:?})",
                    a.label,
                    tags.labels()
                ))
            })?;
            gold.insert((a.range.start, a.range.end, tag));
        }

        let predicted = tagger.tag(instance.tokens())?;
        let mut matched = HashSet::new();
        for m in &predicted {
            let key = (m.start, m.end, m.tag);
            if gold.contains(&key) {
                per_label[m.tag].true_positives += 1;
                matched.insert(key);
            } else if let Some(metrics) = per_label.get_mut(m.tag) {
                metrics.false_positives += 1;
            }
        }
        for &(start, end, tag) in gold.difference(&matched) {
            debug!("Missed gold mention [{}, {}) tag {}", start, end, tag);
            per_label[tag].false_negatives += 1;
        }
    }

    let mut overall = LabelMetrics::default();
    for m in &per_label {
        overall.add(m);
    }

    Ok(NerEvaluation {
        per_label: tags.labels().iter().cloned().zip(per_label).collect(),
        overall,
        num_sentences: instances.len(),
    })
}

// ============================================================================
// Relation Metrics
// ============================================================================

/// Confusion counts for a relation detector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMetrics {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

impl RelationMetrics {
    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1_score(&self) -> f64 {
        f1(self.precision(), self.recall())
    }

    pub fn accuracy(&self) -> f64 {
        let total =
            self.true_positives + self.false_positives + self.true_negatives + self.false_negatives;
        ratio(self.true_positives + self.true_negatives, total)
    }

    pub fn report(&self, relation_type: &str) -> String {
        format!(
            "=== Relation Detection Report ({}) ===\n\n\
               Precision: {:.1}%\n\
               Recall:    {:.1}%\n\
               F1 Score:  {:.1}%\n\
               Accuracy:  {:.1}%\n\
               TP: {} | FP: {} | TN: {} | FN: {}\n",
            relation_type,
            self.precision() * 100.0,
            self.recall() * 100.0,
            self.f1_score() * 100.0,
            self.accuracy() * 100.0,
            self.true_positives,
            self.false_positives,
            self.true_negatives,
            self.false_negatives,
        )
    }
}

/// Score `positives` and `negatives`; a positive score predicts the relation
pub fn evaluate_binary_relation_detector(
    detector: &BinaryRelationDetector,
    positives: &[BinaryRelation],
    negatives: &[BinaryRelation],
) -> Result<RelationMetrics> {
    let mut metrics = RelationMetrics::default();
    for relation in positives {
        if detector.classify(relation)? > 0.0 {
            metrics.true_positives += 1;
        } else {
            metrics.false_negatives += 1;
        }
    }
    for relation in negatives {
        if detector.classify(relation)? > 0.0 {
            metrics.false_positives += 1;
        } else {
            metrics.true_negatives += 1;
        }
    }
    Ok(metrics)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tagwise_core::{EntityMention, TagVocabulary, Token};

    use crate::testing::words;

    /// Returns fixed mentions regardless of input
    struct Fixed {
        tags: TagVocabulary,
        mentions: Vec<EntityMention>,
    }

    impl EntityTagger for Fixed {
        fn tag(&self, _tokens: &[Token]) -> Result<Vec<EntityMention>> {
            Ok(self.mentions.clone())
        }

        fn tag_vocabulary(&self) -> &TagVocabulary {
            &self.tags
        }
    }

    fn fixed(mentions: Vec<EntityMention>) -> Fixed {
        Fixed {
            tags: TagVocabulary::from(vec!["person".to_string(), "org".to_string()]),
            mentions,
        }
    }

    fn instance() -> TrainingInstance {
        TrainingInstance::with_entities(
            words(&["My", "name", "is", "Davis", "King", "and", "I", "work", "for", "MIT", "."]),
            [(3, 2, "person"), (9, 1, "org")],
        )
        .unwrap()
    }

    #[test]
    fn test_label_metrics() {
        let metrics = LabelMetrics {
            true_positives: 80,
            false_positives: 20,
            false_negatives: 20,
        };
        assert!((metrics.precision() - 0.8).abs() < 1e-9);
        assert!((metrics.recall() - 0.8).abs() < 1e-9);
        assert!((metrics.f1_score() - 0.8).abs() < 1e-9);
        assert_eq!(LabelMetrics::default().f1_score(), 0.0);
    }

    #[test]
    fn test_perfect_tagger() {
        let tagger = fixed(vec![EntityMention::new(3, 5, 0, 1.0), EntityMention::new(9, 10, 1, 1.0)]);
        let eval = evaluate_named_entity_recognizer(&tagger, &[instance()]).unwrap();
        assert_eq!(eval.overall.true_positives, 2);
        assert!((eval.overall.f1_score() - 1.0).abs() < 1e-9);
        assert_eq!(eval.num_sentences, 1);
    }

    #[test]
    fn test_wrong_label_and_span() {
        // Right span, wrong label; and a span one token too short
        let tagger = fixed(vec![EntityMention::new(3, 4, 0, 1.0), EntityMention::new(9, 10, 0, 1.0)]);
        let eval = evaluate_named_entity_recognizer(&tagger, &[instance()]).unwrap();

        let person = eval.label("person").unwrap();
        assert_eq!((person.true_positives, person.false_positives, person.false_negatives), (0, 2, 1));
        let org = eval.label("org").unwrap();
        assert_eq!((org.true_positives, org.false_negatives), (0, 1));
        assert_eq!(eval.overall.precision(), 0.0);
    }

    #[test]
    fn test_unknown_gold_label() {
        let tagger = fixed(Vec::new());
        let instance = TrainingInstance::with_entities(words(&["Paris"]), [(0, 1, "location")]).unwrap();
        assert!(matches!(
            evaluate_named_entity_recognizer(&tagger, &[instance]),
            Err(TagwiseError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_report_lists_labels() {
        let tagger = fixed(vec![EntityMention::new(3, 5, 0, 1.0)]);
        let report = evaluate_named_entity_recognizer(&tagger, &[instance()])
            .unwrap()
            .report();
        assert!(report.contains("Sentences evaluated: 1"));
        assert!(report.contains("person"));
        assert!(report.contains("overall"));
    }

    #[test]
    fn test_relation_metrics() {
        let metrics = RelationMetrics {
            true_positives: 35,
            false_positives: 15,
            true_negatives: 40,
            false_negatives: 10,
        };
        assert!((metrics.precision() - 0.7).abs() < 1e-9);
        assert!((metrics.accuracy() - 0.75).abs() < 1e-9);
        assert!(metrics.report("works_for").contains("works_for"));
    }
}
