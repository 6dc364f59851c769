//! End-to-end training behavior: unsupervised robustness, supervised
//! exports, counters and referential integrity.

use std::collections::BTreeSet;

use medanno::cdb::{prepare_name, PreparedName};
use medanno::prelude::*;
use ndarray::arr1;

fn annotator_with(
    mut config: Config,
    concepts: &[(&str, &str, NameStatus)],
) -> Annotator {
    // Deterministic tests: no negative sampling noise.
    config.components.linking.negative_probability = 0.0;
    config.components.linking.random_replacement_unsupervised = 1.0;
    let tokenizer = RegexTokenizer::new(None);
    let mut cdb = Cdb::new();
    for (cui, raw, status) in concepts {
        let prepared: Vec<PreparedName> = prepare_name(raw, &tokenizer, &config)
            .into_iter()
            .collect();
        cdb.add_concept(
            cui,
            &prepared,
            *status,
            BTreeSet::new(),
            BTreeSet::new(),
            None,
            false,
            &config.general.separator,
        );
    }
    let mut vocab = Vocab::new();
    for (word, count, vec) in [
        ("kidney", 100u64, [1.0f32, 0.0]),
        ("failure", 90, [0.0, 1.0]),
        ("dialysis", 50, [0.5, 0.5]),
    ] {
        vocab.add_word(word, count, Some(arr1(&vec)), false);
    }
    Annotator::new(cdb, vocab, config).unwrap()
}

#[test]
fn unsupervised_training_never_crashes_on_bad_input() {
    let annotator = annotator_with(
        Config::default(),
        &[("C001", "kidney failure", NameStatus::Automatic)],
    );
    // Empty string, whitespace-only (the None-equivalent after trimming),
    // and one valid line.
    let corpus = ["", "   ", "patient with kidney failure on dialysis"];
    annotator
        .trainer()
        .train_unsupervised(corpus, 1, true, 0)
        .unwrap();
    assert!(
        annotator.cdb().read().cui2info["C001"].count_train >= 1,
        "the valid line must have trained the concept"
    );
}

#[test]
fn unsupervised_counts_are_monotonic_per_epoch() {
    let annotator = annotator_with(
        Config::default(),
        &[("C001", "kidney failure", NameStatus::Automatic)],
    );
    let corpus = ["kidney failure seen", "kidney failure again"];
    annotator
        .trainer()
        .train_unsupervised(corpus, 3, true, 0)
        .unwrap();
    // 2 mentions × 3 epochs.
    assert_eq!(annotator.cdb().read().cui2info["C001"].count_train, 6);
    assert_eq!(
        annotator.cdb().read().name2info["kidney~failure"].count_train,
        6
    );
}

#[test]
fn fine_tune_false_resets_previous_training() {
    let annotator = annotator_with(
        Config::default(),
        &[("C001", "kidney failure", NameStatus::Automatic)],
    );
    let trainer = annotator.trainer();
    trainer
        .train_unsupervised(["kidney failure one"], 1, true, 0)
        .unwrap();
    assert_eq!(annotator.cdb().read().cui2info["C001"].count_train, 1);
    trainer
        .train_unsupervised(["kidney failure two"], 1, false, 0)
        .unwrap();
    // Old training was cleared before the new single pass.
    assert_eq!(annotator.cdb().read().cui2info["C001"].count_train, 1);
}

#[test]
fn supervised_monotonic_count_with_unrelated_failures() {
    let annotator = annotator_with(
        Config::default(),
        &[("C001", "kidney failure", NameStatus::Automatic)],
    );
    // Three positive examples for C001, plus an annotation whose offsets
    // map to no tokens (skipped, logged) for an unrelated CUI.
    let export = TrainerExport::from_json(
        r#"{
          "projects": [{
            "name": "p1",
            "cuis": [],
            "documents": [
              {"text": "kidney failure one", "annotations": [
                {"cui": "C001", "start": 0, "end": 14, "value": "kidney failure"}
              ]},
              {"text": "kidney failure two", "annotations": [
                {"cui": "C001", "start": 0, "end": 14, "value": "kidney failure"},
                {"cui": "C777", "start": 500, "end": 510, "value": "ghost"}
              ]},
              {"text": "kidney failure three", "annotations": [
                {"cui": "C001", "start": 0, "end": 14, "value": "kidney failure"}
              ]}
            ]
          }]
        }"#,
    )
    .unwrap();
    let before = annotator.cdb().read().cui2info["C001"].count_train;
    let stats = annotator
        .trainer()
        .train_supervised_raw(&export, &SupervisedOptions::default())
        .unwrap();
    assert_eq!(stats.positives, 3);
    assert_eq!(stats.skipped, 1);
    let after = annotator.cdb().read().cui2info["C001"].count_train;
    assert_eq!(after - before, 3, "count advances by exactly N positives");
}

#[test]
fn supervised_killed_removes_name_from_ambiguity_set() {
    let annotator = annotator_with(
        Config::default(),
        &[
            ("C001", "kidney failure", NameStatus::Automatic),
            ("C002", "kidney failure", NameStatus::Automatic),
        ],
    );
    assert!(annotator.cdb().read().name2info["kidney~failure"]
        .cuis
        .contains("C002"));
    let export = TrainerExport::from_json(
        r#"{
          "projects": [{
            "name": "p1",
            "cuis": [],
            "documents": [
              {"text": "kidney failure mentioned", "annotations": [
                {"cui": "C002", "start": 0, "end": 14, "value": "kidney failure", "killed": true}
              ]}
            ]
          }]
        }"#,
    )
    .unwrap();
    let stats = annotator
        .trainer()
        .train_supervised_raw(&export, &SupervisedOptions::default())
        .unwrap();
    assert_eq!(stats.terminated, 1);

    let cdb = annotator.cdb().read();
    let name_info = &cdb.name2info["kidney~failure"];
    assert!(!name_info.cuis.contains("C002"));
    assert!(name_info.cuis.contains("C001"));
    assert!(!cdb.cui2info["C002"].names.contains("kidney~failure"));
    assert!(
        cdb.integrity_violations().is_empty(),
        "referential integrity must survive termination"
    );
}

#[test]
fn supervised_deleted_trains_negative_without_count() {
    let annotator = annotator_with(
        Config::default(),
        &[("C001", "kidney failure", NameStatus::Automatic)],
    );
    let export = TrainerExport::from_json(
        r#"{
          "projects": [{
            "name": "p1",
            "cuis": [],
            "documents": [
              {"text": "kidney failure was wrong", "annotations": [
                {"cui": "C001", "start": 0, "end": 14, "value": "kidney failure", "deleted": true}
              ]}
            ]
          }]
        }"#,
    )
    .unwrap();
    let stats = annotator
        .trainer()
        .train_supervised_raw(&export, &SupervisedOptions::default())
        .unwrap();
    assert_eq!(stats.negatives, 1);
    let cdb = annotator.cdb().read();
    assert_eq!(cdb.cui2info["C001"].count_train, 0);
    assert!(
        !cdb.cui2info["C001"].context_vectors.is_empty(),
        "vectors moved even though counters did not"
    );
}

#[test]
fn false_positive_mining_trains_negatives() {
    let annotator = annotator_with(
        Config::default(),
        &[("C001", "kidney failure", NameStatus::Primary)],
    );
    // Give the model vectors so the FP span resolves during training mode.
    annotator
        .trainer()
        .train_unsupervised(["kidney failure on dialysis"], 1, true, 0)
        .unwrap();
    let count_after_unsup = annotator.cdb().read().cui2info["C001"].count_train;

    // The export covers no annotations, so the pipeline's own detection
    // is a false positive.
    let export = TrainerExport::from_json(
        r#"{
          "projects": [{
            "name": "p1",
            "cuis": [],
            "documents": [
              {"text": "kidney failure on dialysis", "annotations": []}
            ]
          }]
        }"#,
    )
    .unwrap();
    let options = SupervisedOptions {
        train_from_false_positives: true,
        ..Default::default()
    };
    let stats = annotator
        .trainer()
        .train_supervised_raw(&export, &options)
        .unwrap();
    assert_eq!(stats.false_positives, 1);
    // Negative training: no count advance.
    assert_eq!(
        annotator.cdb().read().cui2info["C001"].count_train,
        count_after_unsup,
    );
}

#[test]
fn training_descriptors_accumulate() {
    let annotator = annotator_with(
        Config::default(),
        &[("C001", "kidney failure", NameStatus::Automatic)],
    );
    annotator
        .trainer()
        .train_unsupervised(["kidney failure"], 2, true, 0)
        .unwrap();
    let export = TrainerExport::from_json(
        r#"{"projects": [{"name": "p1", "cuis": [], "documents": [
            {"text": "kidney failure", "annotations": []}]}]}"#,
    )
    .unwrap();
    annotator
        .trainer()
        .train_supervised_raw(&export, &SupervisedOptions::default())
        .unwrap();
    let config = annotator.config().read();
    assert_eq!(config.meta.unsup_trained.len(), 1);
    assert_eq!(config.meta.unsup_trained[0].num_epochs, 2);
    assert_eq!(config.meta.sup_trained.len(), 1);
}
