//! Map pipeline behavior: round-trips, flattening, filters, error
//! policy, cancellation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::harness::{map_options, prefix_fn, TestProject};
use sift::error::{PipelineError, SiftError};
use sift::pipeline::{CancelHandle, MapFn, MapOptions};
use sift::query::options::{Filter, SelectRowsOptions};
use sift::schema::Value;

#[tokio::test]
async fn test_map_round_trips_through_select_rows() {
    let project = TestProject::new();
    let dataset = project
        .dataset(vec![
            serde_json::json!({"q": "A"}),
            serde_json::json!({"q": "B"}),
            serde_json::json!({"q": "C"}),
        ])
        .await;

    let result = dataset
        .map(
            prefix_fn("Q: "),
            MapOptions {
                input_path: Some("q".into()),
                ..map_options("qp")
            },
        )
        .await
        .unwrap();
    assert_eq!(result.num_processed, 3);
    assert_eq!(result.output_path, "qp".into());

    let rows = dataset
        .select_rows_all(&SelectRowsOptions::with_columns(["q", "qp"]))
        .await
        .unwrap();
    let got: Vec<(String, String)> = rows
        .iter()
        .map(|r| {
            (
                r.value["q"].as_str().unwrap().to_string(),
                r.value["qp"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        got,
        vec![
            ("A".to_string(), "Q: A".to_string()),
            ("B".to_string(), "Q: B".to_string()),
            ("C".to_string(), "Q: C".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_map_over_repeated_field_mirrors_nesting() {
    let project = TestProject::new();
    let dataset = project
        .dataset(vec![
            serde_json::json!({"qs": ["A", "B"]}),
            serde_json::json!({"qs": ["C"]}),
            serde_json::json!({"qs": ["D", "E"]}),
        ])
        .await;

    dataset
        .map(
            prefix_fn("Q: "),
            MapOptions {
                input_path: Some("qs.*".into()),
                ..map_options("qsp")
            },
        )
        .await
        .unwrap();

    let rows = dataset
        .select_rows_all(&SelectRowsOptions::with_columns(["qsp"]))
        .await
        .unwrap();
    let got: Vec<serde_json::Value> = rows.iter().map(|r| r.value["qsp"].clone()).collect();
    assert_eq!(
        got,
        vec![
            serde_json::json!(["Q: A", "Q: B"]),
            serde_json::json!(["Q: C"]),
            serde_json::json!(["Q: D", "Q: E"]),
        ]
    );
}

#[tokio::test]
async fn test_map_with_filters_and_limit() {
    let project = TestProject::new();
    let dataset = project
        .dataset(vec![
            serde_json::json!({"source": "foo", "q": "A"}),
            serde_json::json!({"source": "bar", "q": "B"}),
            serde_json::json!({"source": "bar", "q": "C"}),
        ])
        .await;

    let lower: MapFn = Arc::new(|inputs: &[Value]| {
        Ok(inputs
            .iter()
            .map(|v| v.as_str().map(|s| Value::string(s.to_lowercase())))
            .collect())
    });
    let result = dataset
        .map(
            lower,
            MapOptions {
                input_path: Some("q".into()),
                filters: vec![Filter::equals("source", serde_json::json!("bar"))],
                limit: Some(1),
                ..map_options("ql")
            },
        )
        .await
        .unwrap();

    assert_eq!(result.values, vec![Value::string("b")]);
    assert_eq!(result.num_processed, 1);

    // Untargeted rows read back as null.
    let rows = dataset
        .select_rows_all(&SelectRowsOptions::with_columns(["ql"]))
        .await
        .unwrap();
    let got: Vec<serde_json::Value> = rows.iter().map(|r| r.value["ql"].clone()).collect();
    assert_eq!(
        got,
        vec![
            serde_json::Value::Null,
            serde_json::json!("b"),
            serde_json::Value::Null,
        ]
    );
}

#[tokio::test]
async fn test_map_returning_all_none_records_null_column() {
    let project = TestProject::new();
    let dataset = project
        .dataset(vec![
            serde_json::json!({"q": "A"}),
            serde_json::json!({"q": "B"}),
        ])
        .await;

    let none_fn: MapFn = Arc::new(|inputs: &[Value]| Ok(inputs.iter().map(|_| None).collect()));
    let result = dataset
        .map(
            none_fn,
            MapOptions {
                input_path: Some("q".into()),
                ..map_options("empty")
            },
        )
        .await
        .unwrap();
    assert_eq!(result.num_processed, 2);

    // The column exists with the expected row count, all null.
    let manifest = dataset.manifest();
    let entry = manifest.find_enrichment(&"empty".into()).unwrap();
    assert_eq!(entry.num_items, 2);
    let rows = dataset
        .select_rows_all(&SelectRowsOptions::with_columns(["empty"]))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.value["empty"].is_null()));
}

#[tokio::test]
async fn test_map_without_output_column_is_rejected() {
    let project = TestProject::new();
    let dataset = project.dataset(vec![serde_json::json!({"q": "A"})]).await;
    let result = dataset.map(prefix_fn("x"), MapOptions::default()).await;
    assert!(matches!(result, Err(SiftError::Validation(_))));
}

#[tokio::test]
async fn test_existing_column_rejected_without_overwrite() {
    let project = TestProject::new();
    let dataset = project
        .dataset(vec![serde_json::json!({"q": "A"})])
        .await;
    dataset
        .map(
            prefix_fn("Q: "),
            MapOptions {
                input_path: Some("q".into()),
                ..map_options("qp")
            },
        )
        .await
        .unwrap();

    let again = dataset
        .map(
            prefix_fn("Q: "),
            MapOptions {
                input_path: Some("q".into()),
                ..map_options("qp")
            },
        )
        .await;
    assert!(matches!(
        again,
        Err(SiftError::Pipeline(PipelineError::OutputColumnExists { .. }))
    ));

    // Overwrite replaces the column.
    let replaced = dataset
        .map(
            prefix_fn("R: "),
            MapOptions {
                input_path: Some("q".into()),
                overwrite: true,
                ..map_options("qp")
            },
        )
        .await
        .unwrap();
    assert_eq!(replaced.values, vec![Value::string("R: A")]);
}

#[tokio::test]
async fn test_per_row_errors_yield_null_and_are_counted() {
    let project = TestProject::new();
    let dataset = project
        .dataset(vec![
            serde_json::json!({"q": "ok"}),
            serde_json::json!({"q": "boom"}),
            serde_json::json!({"q": "fine"}),
        ])
        .await;

    let failing: MapFn = Arc::new(|inputs: &[Value]| {
        if inputs.iter().any(|v| v.as_str() == Some("boom")) {
            return Err(SiftError::Validation("boom".to_string()));
        }
        Ok(inputs.iter().map(|v| Some(v.clone())).collect())
    });
    let result = dataset
        .map(
            failing,
            MapOptions {
                input_path: Some("q".into()),
                batch_size: 1,
                ..map_options("echo")
            },
        )
        .await
        .unwrap();
    assert_eq!(result.num_errors, 1);
    assert_eq!(result.num_processed, 3);
    assert_eq!(result.values[1], Value::Null);
    assert_eq!(result.values[2], Value::string("fine"));
}

#[tokio::test]
async fn test_error_threshold_aborts() {
    let project = TestProject::new();
    let dataset = project
        .dataset(
            (0..8)
                .map(|i| serde_json::json!({ "q": format!("row {i}") }))
                .collect(),
        )
        .await;

    let always_fail: MapFn = Arc::new(|_: &[Value]| {
        Err(SiftError::Validation("nope".to_string()))
    });
    let result = dataset
        .map(
            always_fail,
            MapOptions {
                input_path: Some("q".into()),
                batch_size: 1,
                max_errors: Some(2),
                ..map_options("bad")
            },
        )
        .await;
    assert!(matches!(
        result,
        Err(SiftError::Pipeline(
            PipelineError::RowErrorThresholdExceeded { .. }
        ))
    ));
}

#[tokio::test]
async fn test_wrong_output_length_is_input_exhausted() {
    let project = TestProject::new();
    let dataset = project
        .dataset(vec![serde_json::json!({"q": "A"}), serde_json::json!({"q": "B"})])
        .await;

    let short: MapFn = Arc::new(|_: &[Value]| Ok(vec![]));
    let result = dataset
        .map(
            short,
            MapOptions {
                input_path: Some("q".into()),
                batch_size: -1,
                ..map_options("short")
            },
        )
        .await;
    assert!(matches!(
        result,
        Err(SiftError::Pipeline(PipelineError::InputExhausted { .. }))
    ));
}

#[tokio::test]
async fn test_cancellation_drains_and_resumes() {
    let project = TestProject::new();
    let items: Vec<serde_json::Value> = (0..6)
        .map(|i| serde_json::json!({ "q": format!("row {i}") }))
        .collect();
    let dataset = project.dataset(items).await;

    // Cancel after the first call; in-flight results still flush.
    let cancel = CancelHandle::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let cancelling: MapFn = {
        let cancel = cancel.clone();
        let calls = calls.clone();
        Arc::new(move |inputs: &[Value]| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                cancel.cancel();
            }
            Ok(inputs.iter().map(|v| Some(v.clone())).collect())
        })
    };
    let interrupted = dataset
        .map(
            cancelling,
            MapOptions {
                input_path: Some("q".into()),
                batch_size: 1,
                num_jobs: 1,
                cancel: Some(cancel),
                ..map_options("echo")
            },
        )
        .await;
    assert!(matches!(
        interrupted,
        Err(SiftError::Pipeline(PipelineError::Cancelled))
    ));

    // Partial progress is visible and truthful.
    let manifest = dataset.manifest();
    let entry = manifest.find_enrichment(&"echo".into()).unwrap();
    assert!(entry.num_items >= 1);
    assert!(entry.num_items < 6);

    // A subsequent call resumes and only processes the missing rows.
    let resumed = dataset
        .map(
            prefix_fn(""),
            MapOptions {
                input_path: Some("q".into()),
                batch_size: 1,
                num_jobs: 1,
                ..map_options("echo")
            },
        )
        .await
        .unwrap();
    assert_eq!(resumed.num_processed, 6 - entry.num_items);

    let rows = dataset
        .select_rows_all(&SelectRowsOptions::with_columns(["echo"]))
        .await
        .unwrap();
    let got: Vec<&str> = rows.iter().map(|r| r.value["echo"].as_str().unwrap()).collect();
    assert_eq!(got, vec!["row 0", "row 1", "row 2", "row 3", "row 4", "row 5"]);
}

#[tokio::test]
async fn test_delete_enrichment_leaves_source_untouched() {
    let project = TestProject::new();
    let dataset = project
        .dataset(vec![serde_json::json!({"q": "A"})])
        .await;
    dataset
        .map(
            prefix_fn("Q: "),
            MapOptions {
                input_path: Some("q".into()),
                ..map_options("qp")
            },
        )
        .await
        .unwrap();

    dataset.delete_enrichment(&"qp".into()).await.unwrap();
    assert!(dataset.manifest().find_enrichment(&"qp".into()).is_none());

    let rows = dataset
        .select_rows_all(&SelectRowsOptions::with_columns(["q"]))
        .await
        .unwrap();
    assert_eq!(rows[0].value["q"], serde_json::json!("A"));
}
