//! Concept lifecycle: examples, training, calibration, dataset scoring.

mod common;

use pretty_assertions::assert_eq;

use common::harness::TestProject;
use sift::concepts::{ConceptEdit, ConceptType, ExampleIn};
use sift::error::{ConceptError, SiftError};
use sift::query::options::SelectRowsOptions;

fn example(label: bool, text: &str) -> ExampleIn {
    ExampleIn {
        label,
        text: text.to_string(),
        origin: None,
    }
}

fn seed_spam_concept(project: &TestProject) {
    project
        .ctx
        .concepts
        .create("local", "spam", ConceptType::Text)
        .unwrap();
    project
        .ctx
        .concepts
        .edit(
            "local",
            "spam",
            ConceptEdit {
                insert: vec![
                    example(true, "asdgasdgkasd;lkgajsdl"),
                    example(true, "11757578jfdjja"),
                    example(true, "qqwlekrjzxnmv 99887"),
                    example(false, "This is normal text."),
                    example(false, "See you at the meeting tomorrow."),
                    example(false, "The report covers the third quarter."),
                ],
                ..Default::default()
            },
        )
        .unwrap();
}

#[tokio::test]
async fn test_train_and_score_separates_spam() {
    let project = TestProject::new();
    seed_spam_concept(&project);

    let model = project
        .ctx
        .scorer
        .get_or_train("local", "spam", "hash128")
        .await
        .unwrap();

    let embedder = project.ctx.embeddings.get("hash128").unwrap();
    let vectors = embedder
        .embed_batch(&[
            "This is normal text.".to_string(),
            "asdgasdgasdg".to_string(),
        ])
        .await
        .unwrap();
    let scores = model.score(&vectors).unwrap();
    assert!(scores[0] < 0.5, "normal text scored {}", scores[0]);
    assert!(scores[1] > 0.5, "gibberish scored {}", scores[1]);
    assert!(model.metrics.roc_auc > 0.5);
}

#[tokio::test]
async fn test_zero_negatives_refuses_to_train() {
    let project = TestProject::new();
    project
        .ctx
        .concepts
        .create("local", "onlypos", ConceptType::Text)
        .unwrap();
    project
        .ctx
        .concepts
        .edit(
            "local",
            "onlypos",
            ConceptEdit {
                insert: vec![example(true, "a positive example")],
                ..Default::default()
            },
        )
        .unwrap();

    let result = project
        .ctx
        .scorer
        .get_or_train("local", "onlypos", "hash128")
        .await;
    assert!(matches!(
        result,
        Err(SiftError::Concept(ConceptError::NeedsNegatives { .. }))
    ));
}

#[tokio::test]
async fn test_unknown_concept_is_not_found() {
    let project = TestProject::new();
    let result = project.ctx.concepts.get("local", "missing");
    assert!(matches!(
        result,
        Err(SiftError::Concept(ConceptError::NotFound { .. }))
    ));
}

#[tokio::test]
async fn test_compute_concept_scores_chunks() {
    let project = TestProject::new();
    seed_spam_concept(&project);

    let dataset = project
        .dataset(vec![
            serde_json::json!({"text": "asdgasdg kjasdlkgj zzwqke."}),
            serde_json::json!({"text": "A perfectly ordinary sentence."}),
        ])
        .await;
    dataset
        .compute_embedding("hash128", &"text".into())
        .await
        .unwrap();

    // Concept inference requires the embedding column.
    let missing = dataset
        .compute_concept("local", "spam", "hash128", &"other".into())
        .await;
    assert!(missing.is_err());

    dataset
        .compute_concept("local", "spam", "hash128", &"text".into())
        .await
        .unwrap();

    let rows = dataset
        .select_rows_all(&SelectRowsOptions::with_columns([
            "text.local/spam/hash128",
        ]))
        .await
        .unwrap();
    let scored = &rows[0].value["text"]["local/spam/hash128"];
    let chunks = scored.as_array().unwrap();
    assert!(!chunks.is_empty());
    assert!(chunks[0]["span"]["end"].as_u64().unwrap() > 0);
    let gibberish_score = chunks[0]["score"].as_f64().unwrap();
    let normal_score =
        rows[1].value["text"]["local/spam/hash128"][0]["score"].as_f64().unwrap();
    assert!(
        gibberish_score > normal_score,
        "expected {gibberish_score} > {normal_score}"
    );
}

#[tokio::test]
async fn test_edit_invalidates_trained_model() {
    let project = TestProject::new();
    seed_spam_concept(&project);

    let first = project
        .ctx
        .scorer
        .get_or_train("local", "spam", "hash128")
        .await
        .unwrap();

    project
        .ctx
        .concepts
        .edit(
            "local",
            "spam",
            ConceptEdit {
                insert: vec![example(false, "another ordinary sentence")],
                ..Default::default()
            },
        )
        .unwrap();

    let second = project
        .ctx
        .scorer
        .get_or_train("local", "spam", "hash128")
        .await
        .unwrap();
    assert_ne!(first.examples_hash, second.examples_hash);
    assert_eq!(second.metrics.num_negatives, 4);
}

#[tokio::test]
async fn test_remove_example_by_id() {
    let project = TestProject::new();
    seed_spam_concept(&project);
    let concept = project.ctx.concepts.get("local", "spam").unwrap();
    let victim = concept.examples[0].id.clone();
    let edited = project
        .ctx
        .concepts
        .edit(
            "local",
            "spam",
            ConceptEdit {
                remove: vec![victim.clone()],
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(edited.examples.len(), concept.examples.len() - 1);
    assert!(edited.examples.iter().all(|e| e.id != victim));
    assert_eq!(edited.version, concept.version + 1);
}
