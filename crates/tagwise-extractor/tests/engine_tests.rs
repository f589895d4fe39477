//! End-to-end tests: train, tag, persist and relate
//!
//! Every test builds its own small word feature extractor, so nothing here
//! needs pretrained model files.

use std::sync::{Arc, OnceLock};

use proptest::prelude::*;
use tagwise_core::{tokenize, tokens_from_words, EngineConfig, TagwiseError, Token};
use tagwise_extractor::hashing::hash_str;
use tagwise_extractor::{
    evaluate_named_entity_recognizer, NamedEntityExtractor, NerTrainer, TrainingInstance,
    WordFeatureExtractor,
};

const VOCABULARY: &[&str] = &[
    "my", "name", "is", "davis", "king", "and", "i", "work", "for", "mit", ".", "the", "other",
    "day", "at", "saw", "brian", "smith", "from", "cmu", "met", "john", "in", "boston",
];

fn extractor() -> Arc<WordFeatureExtractor> {
    let vectors = VOCABULARY.iter().map(|w| {
        let v: Vec<f32> = (0..10u64)
            .map(|i| (hash_str(w, i) % 1001) as f32 / 500.0 - 1.0)
            .collect();
        (*w, v)
    });
    Arc::new(WordFeatureExtractor::from_word_vectors(vectors).unwrap())
}

fn words(words: &[&str]) -> Vec<Token> {
    tokens_from_words(words)
}

fn davis_king() -> Vec<Token> {
    words(&["My", "name", "is", "Davis", "King", "and", "I", "work", "for", "MIT", "."])
}

fn brian_smith() -> Vec<Token> {
    words(&["The", "other", "day", "at", "work", "I", "saw", "Brian", "Smith", "from", "CMU", "."])
}

fn training_set() -> Vec<TrainingInstance> {
    vec![
        TrainingInstance::new(davis_king())
            .with_entity(3, 2, "person")
            .unwrap()
            .with_entity(9, 1, "org")
            .unwrap(),
        TrainingInstance::new(brian_smith())
            .with_entity(7, 2, "person")
            .unwrap()
            .with_entity(10, 1, "org")
            .unwrap(),
    ]
}

fn trainer(fe: Arc<WordFeatureExtractor>) -> NerTrainer {
    let mut trainer = NerTrainer::new(fe);
    for instance in training_set() {
        trainer.add(instance).unwrap();
    }
    trainer
}

fn trained() -> &'static NamedEntityExtractor {
    static MODEL: OnceLock<NamedEntityExtractor> = OnceLock::new();
    MODEL.get_or_init(|| trainer(extractor()).train(1).unwrap())
}

fn spans(ner: &NamedEntityExtractor, tokens: &[Token]) -> Vec<(usize, usize, String)> {
    ner.tag(tokens)
        .unwrap()
        .into_iter()
        .map(|m| (m.start, m.end, ner.tag_name(m.tag).unwrap().to_string()))
        .collect()
}

// =============================================================================
// Training
// =============================================================================

#[test]
fn test_learns_training_sentences() {
    let ner = trained();
    assert_eq!(ner.possible_tags(), ["person".to_string(), "org".to_string()]);
    assert_eq!(
        spans(ner, &davis_king()),
        vec![(3, 5, "person".to_string()), (9, 10, "org".to_string())]
    );
    assert_eq!(
        spans(ner, &brian_smith()),
        vec![(7, 9, "person".to_string()), (10, 11, "org".to_string())]
    );

    let eval = evaluate_named_entity_recognizer(ner, &training_set()).unwrap();
    assert_eq!(eval.overall.true_positives, 4);
    assert!((eval.overall.f1_score() - 1.0).abs() < 1e-9);
}

#[test]
fn test_empty_training_set() {
    let trainer = NerTrainer::new(extractor());
    assert_eq!(trainer.size(), 0);
    assert!(matches!(
        trainer.train(4),
        Err(TagwiseError::EmptyTrainingSet(_))
    ));
}

#[test]
fn test_overlapping_annotation_rejected() {
    let mut instance = TrainingInstance::new(davis_king());
    instance.add_entity(2, 3, "person").unwrap();
    let err = instance.add_entity(3, 2, "org").unwrap_err();
    assert!(matches!(err, TagwiseError::OverlappingAnnotation { .. }));
    assert_eq!(instance.num_entities(), 1);
}

#[test]
fn test_training_is_deterministic_per_thread_count() {
    let fe = extractor();
    let a = trainer(fe.clone()).train(3).unwrap();
    let b = trainer(fe).train(3).unwrap();
    assert_eq!(a.tagger().weights(), b.tagger().weights());
}

#[test]
fn test_config_controls_thread_count() {
    let config = EngineConfig::default();
    let trainer = NerTrainer::new(extractor()).with_config(config.clone()).unwrap();
    assert_eq!(trainer.num_threads(), config.training.thread_count);
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_bundled_round_trip_tags_identically() {
    let ner = trained();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ner_model.dat");
    ner.save(&path).unwrap();

    let loaded = NamedEntityExtractor::load(&path).unwrap();
    assert_eq!(loaded.possible_tags(), ner.possible_tags());
    for tokens in [davis_king(), brian_smith()] {
        assert_eq!(loaded.tag(&tokens).unwrap(), ner.tag(&tokens).unwrap());
    }
}

#[test]
fn test_separate_models_match_bundled() {
    let fe = extractor();
    let trainer = trainer(fe.clone());
    let dir = tempfile::tempdir().unwrap();
    let separate = dir.path().join("ner_separate.dat");

    let tagger = trainer.train_separate_models(1, &separate).unwrap();
    assert_eq!(tagger.weights(), trained().tagger().weights());

    assert!(matches!(
        NamedEntityExtractor::load(&separate),
        Err(TagwiseError::FeatureExtractorRequired)
    ));
    let loaded = NamedEntityExtractor::load_with_extractor(&separate, fe).unwrap();
    assert_eq!(
        loaded.tag(&davis_king()).unwrap(),
        trained().tag(&davis_king()).unwrap()
    );
}

#[test]
fn test_extractor_file_round_trip() {
    let fe = extractor();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("total_word_feature_extractor.dat");
    fe.save(&path).unwrap();
    let loaded = WordFeatureExtractor::load(&path).unwrap();
    assert_eq!(loaded.fingerprint(), fe.fingerprint());

    // A model file is not an extractor file
    let ner_path = dir.path().join("ner.dat");
    trained().save(&ner_path).unwrap();
    assert!(matches!(
        WordFeatureExtractor::load(&ner_path),
        Err(TagwiseError::ModelLoad { .. })
    ));
}

// =============================================================================
// Inference
// =============================================================================

#[test]
fn test_concurrent_tagging_matches_sequential() {
    let ner = trained();
    let inputs = vec![davis_king(), brian_smith(), words(&["John", "met", "Davis", "King"])];
    let sequential: Vec<_> = inputs.iter().map(|t| ner.tag(t).unwrap()).collect();

    let concurrent: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = inputs
            .iter()
            .map(|t| scope.spawn(move || ner.tag(t).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(concurrent, sequential);
}

#[test]
fn test_extract_entities_from_text() {
    let text = "My name is Davis King and I work for MIT.";
    let entities = trained().extract_entities(text).unwrap();
    assert_eq!(tokenize(text).len(), 11);

    let found: Vec<_> = entities.iter().map(|e| (e.text.as_str(), e.label.as_str())).collect();
    assert_eq!(found, vec![("Davis King", "person"), ("MIT", "org")]);
    assert_eq!(&text[entities[0].start..entities[0].end], "Davis King");
    assert_eq!(entities[0].tokens, 3..5);

    let json = serde_json::to_value(&entities[1]).unwrap();
    assert_eq!(json["label"], "org");
}

#[test]
fn test_relation_features_are_order_sensitive() {
    let ner = trained();
    let tokens = davis_king();
    let mentions = ner.tag(&tokens).unwrap();
    assert_eq!(mentions.len(), 2);

    let forward = ner.extract_relation(&tokens, &mentions[0], &mentions[1]).unwrap();
    let backward = ner.extract_relation(&tokens, &mentions[1], &mentions[0]).unwrap();
    assert_ne!(forward, backward);
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_mentions_are_ordered_disjoint_and_in_bounds(
        picks in proptest::collection::vec(0..VOCABULARY.len() + 3, 0..20)
    ) {
        let extra = ["Zanzibar", "1999", "X-ray"];
        let sentence: Vec<&str> = picks
            .iter()
            .map(|&i| VOCABULARY.get(i).copied().unwrap_or_else(|| extra[i - VOCABULARY.len()]))
            .collect();
        let tokens = tokens_from_words(&sentence);
        let ner = trained();
        let mentions = ner.tag(&tokens).unwrap();

        let mut last_end = 0;
        for m in &mentions {
            prop_assert!(m.start < m.end && m.end <= tokens.len());
            prop_assert!(m.start >= last_end);
            prop_assert!(m.tag < ner.possible_tags().len());
            prop_assert!(m.score.is_finite());
            last_end = m.end;
        }
        prop_assert_eq!(ner.tag(&tokens).unwrap(), mentions);
    }
}
