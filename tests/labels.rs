//! Label store: selections, include/exclude filtering, projection.

mod common;

use pretty_assertions::assert_eq;

use common::harness::TestProject;
use sift::dataset::LabelSelection;
use sift::query::options::{Filter, SelectRowsOptions};

fn items() -> Vec<serde_json::Value> {
    vec![
        serde_json::json!({"q": "A", "source": "web"}),
        serde_json::json!({"q": "B", "source": "app"}),
        serde_json::json!({"q": "C", "source": "web"}),
    ]
}

#[tokio::test]
async fn test_add_labels_by_row_ids_and_filter_queries() {
    let project = TestProject::new();
    let dataset = project.dataset(items()).await;

    // By explicit row ids.
    let all = dataset
        .select_rows_all(&SelectRowsOptions::default())
        .await
        .unwrap();
    let first_id = all[0].row_id.clone();
    let changed = dataset
        .add_labels("starred", LabelSelection::RowIds(vec![first_id.clone()]))
        .await
        .unwrap();
    assert_eq!(changed, 1);

    // By query selection.
    let changed = dataset
        .add_labels(
            "from_web",
            LabelSelection::Query(Box::new(SelectRowsOptions {
                filters: vec![Filter::equals("source", serde_json::json!("web"))],
                ..Default::default()
            })),
        )
        .await
        .unwrap();
    assert_eq!(changed, 2);
    assert!(dataset.labels().has_label(&first_id, "starred"));
    assert!(dataset.labels().has_label(&first_id, "from_web"));
}

#[tokio::test]
async fn test_include_and_exclude_labels_in_select() {
    let project = TestProject::new();
    let dataset = project.dataset(items()).await;
    let all = dataset
        .select_rows_all(&SelectRowsOptions::default())
        .await
        .unwrap();
    dataset
        .add_labels(
            "keep",
            LabelSelection::RowIds(vec![all[0].row_id.clone(), all[2].row_id.clone()]),
        )
        .await
        .unwrap();

    let included = dataset
        .select_rows_all(&SelectRowsOptions {
            include_labels: vec!["keep".to_string()],
            ..SelectRowsOptions::with_columns(["q"])
        })
        .await
        .unwrap();
    let qs: Vec<&str> = included
        .iter()
        .map(|r| r.value["q"].as_str().unwrap())
        .collect();
    assert_eq!(qs, vec!["A", "C"]);

    let excluded = dataset
        .select_rows_all(&SelectRowsOptions {
            exclude_labels: vec!["keep".to_string()],
            ..SelectRowsOptions::with_columns(["q"])
        })
        .await
        .unwrap();
    let qs: Vec<&str> = excluded
        .iter()
        .map(|r| r.value["q"].as_str().unwrap())
        .collect();
    assert_eq!(qs, vec!["B"]);
}

#[tokio::test]
async fn test_remove_labels_is_symmetric() {
    let project = TestProject::new();
    let dataset = project.dataset(items()).await;
    let all = dataset
        .select_rows_all(&SelectRowsOptions::default())
        .await
        .unwrap();
    let ids: Vec<String> = all.iter().map(|r| r.row_id.clone()).collect();

    dataset
        .add_labels("tmp", LabelSelection::RowIds(ids.clone()))
        .await
        .unwrap();
    let removed = dataset
        .remove_labels("tmp", LabelSelection::RowIds(ids[..2].to_vec()))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!(!dataset.labels().has_label(&ids[0], "tmp"));
    assert!(dataset.labels().has_label(&ids[2], "tmp"));
}

#[tokio::test]
async fn test_labels_project_as_paths() {
    let project = TestProject::new();
    let dataset = project.dataset(items()).await;
    let all = dataset
        .select_rows_all(&SelectRowsOptions::default())
        .await
        .unwrap();
    dataset
        .add_labels("starred", LabelSelection::RowIds(vec![all[0].row_id.clone()]))
        .await
        .unwrap();

    let rows = dataset
        .select_rows_all(&SelectRowsOptions::with_columns(["q", "__labels__.starred"]))
        .await
        .unwrap();
    assert_eq!(rows[0].value["__labels__"]["starred"]["label"], serde_json::json!(true));
    assert!(rows[1].value["__labels__"]["starred"].is_null());
}
