//! Model-pack round-trip: save → load must preserve annotation behavior.

use std::collections::BTreeSet;

use medanno::cdb::{prepare_name, PreparedName};
use medanno::prelude::*;
use medanno::LoadOptions;
use ndarray::arr1;

fn trained_annotator() -> Annotator {
    let mut config = Config::default();
    config.components.linking.negative_probability = 0.0;
    config.annotation_output.include_text_in_output = true;
    let tokenizer = RegexTokenizer::new(None);
    let mut cdb = Cdb::new();
    for (cui, raw, status) in [
        ("C001", "kidney failure", NameStatus::Primary),
        ("C002", "dialysis", NameStatus::Automatic),
    ] {
        let prepared: Vec<PreparedName> = prepare_name(raw, &tokenizer, &config)
            .into_iter()
            .collect();
        cdb.add_concept(
            cui,
            &prepared,
            status,
            BTreeSet::from(["T047".to_string()]),
            BTreeSet::new(),
            None,
            false,
            "~",
        );
    }
    let mut vocab = Vocab::new();
    for (word, count, vec) in [
        ("kidney", 100u64, [1.0f32, 0.0, 0.2]),
        ("failure", 90, [0.0, 1.0, 0.1]),
        ("dialysis", 50, [0.4, 0.4, 0.6]),
        ("chronic", 40, [0.2, 0.8, 0.0]),
    ] {
        vocab.add_word(word, count, Some(arr1(&vec)), false);
    }
    let annotator = Annotator::new(cdb, vocab, config).unwrap();
    annotator
        .trainer()
        .train_unsupervised(
            [
                "chronic kidney failure on dialysis",
                "dialysis for kidney failure",
            ],
            2,
            true,
            0,
        )
        .unwrap();
    annotator
}

#[test]
fn saved_and_loaded_models_annotate_identically() {
    let original = trained_annotator();
    let dir = tempfile::tempdir().unwrap();
    original.save_model_pack(dir.path()).unwrap();
    let loaded = Annotator::load_model_pack(dir.path(), LoadOptions::default()).unwrap();

    let text = "Follow-up for chronic kidney failure; continues dialysis.";
    let before = original.get_entities(text).unwrap();
    let after = loaded.get_entities(text).unwrap();

    assert!(!before.entities.is_empty(), "fixture must produce entities");
    // Identical output: same ids, CUIs, spans and similarity values.
    assert_eq!(
        serde_json::to_value(&before).unwrap(),
        serde_json::to_value(&after).unwrap()
    );
}

#[test]
fn loaded_model_preserves_training_state() {
    let original = trained_annotator();
    let dir = tempfile::tempdir().unwrap();
    original.save_model_pack(dir.path()).unwrap();
    let loaded = Annotator::load_model_pack(dir.path(), LoadOptions::default()).unwrap();

    let orig_cdb = original.cdb().read();
    let loaded_cdb = loaded.cdb().read();
    for (cui, info) in &orig_cdb.cui2info {
        let loaded_info = &loaded_cdb.cui2info[cui];
        assert_eq!(info.count_train, loaded_info.count_train);
        assert_eq!(info.average_confidence, loaded_info.average_confidence);
        assert_eq!(info.context_vectors, loaded_info.context_vectors);
    }
    assert!(loaded_cdb.integrity_violations().is_empty());
    // Training metadata rides along in the config.
    assert_eq!(loaded.config().read().meta.unsup_trained.len(), 1);
}

#[test]
fn loaded_model_can_keep_training() {
    let original = trained_annotator();
    let dir = tempfile::tempdir().unwrap();
    original.save_model_pack(dir.path()).unwrap();
    let loaded = Annotator::load_model_pack(dir.path(), LoadOptions::default()).unwrap();

    let before = loaded.cdb().read().cui2info["C001"].count_train;
    loaded
        .trainer()
        .train_unsupervised(["kidney failure recurring"], 1, true, 0)
        .unwrap();
    assert_eq!(loaded.cdb().read().cui2info["C001"].count_train, before + 1);
}
