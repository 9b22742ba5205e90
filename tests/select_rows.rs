//! Query engine: projection, filters, sorts, pagination, UDF columns.

mod common;

use pretty_assertions::assert_eq;

use common::harness::TestProject;
use sift::error::{QueryError, SchemaError, SiftError};
use sift::query::options::{
    BinaryOp, Column, Filter, ListOp, SelectRowsOptions, SortOrder, UnaryOp,
};
use sift::signals::SignalDescriptor;

fn reviews() -> Vec<serde_json::Value> {
    vec![
        serde_json::json!({"text": "Great product, would buy again.", "stars": 5, "source": "web"}),
        serde_json::json!({"text": "Terrible. Broke after a day.", "stars": 1, "source": "app"}),
        serde_json::json!({"text": "It is fine.", "stars": 3, "source": "web"}),
        serde_json::json!({"text": "Great value for the price.", "stars": 5, "source": "app"}),
    ]
}

#[tokio::test]
async fn test_default_projection_includes_all_columns() {
    let project = TestProject::new();
    let dataset = project.dataset(reviews()).await;
    let rows = dataset
        .select_rows_all(&SelectRowsOptions::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows[0].value.get("text").is_some());
    assert!(rows[0].value.get("stars").is_some());
    assert!(rows[0].value.get("source").is_some());
    assert!(rows[0].value.get("__rowid__").is_some());
}

#[tokio::test]
async fn test_filters_combine_with_and() {
    let project = TestProject::new();
    let dataset = project.dataset(reviews()).await;
    let rows = dataset
        .select_rows_all(&SelectRowsOptions {
            filters: vec![
                Filter::equals("source", serde_json::json!("web")),
                Filter::Binary {
                    path: "stars".into(),
                    op: BinaryOp::GreaterEqual,
                    value: serde_json::json!(4),
                },
            ],
            ..SelectRowsOptions::with_columns(["text"])
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].value["text"],
        serde_json::json!("Great product, would buy again.")
    );
}

#[tokio::test]
async fn test_in_length_and_regex_filters() {
    let project = TestProject::new();
    let dataset = project.dataset(reviews()).await;

    let by_in = dataset
        .select_rows_all(&SelectRowsOptions {
            filters: vec![Filter::List {
                path: "stars".into(),
                op: ListOp::In,
                values: vec![serde_json::json!(1), serde_json::json!(3)],
            }],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_in.len(), 2);

    let by_length = dataset
        .select_rows_all(&SelectRowsOptions {
            filters: vec![Filter::Binary {
                path: "text".into(),
                op: BinaryOp::LengthLess,
                value: serde_json::json!(15),
            }],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_length.len(), 1);
    assert_eq!(by_length[0].value["text"], serde_json::json!("It is fine."));

    let by_regex = dataset
        .select_rows_all(&SelectRowsOptions {
            filters: vec![Filter::Binary {
                path: "text".into(),
                op: BinaryOp::RegexMatches,
                value: serde_json::json!("^Great"),
            }],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_regex.len(), 2);
}

#[tokio::test]
async fn test_exists_filters() {
    let project = TestProject::new();
    let dataset = project
        .dataset(vec![
            serde_json::json!({"q": "A", "note": "has one"}),
            serde_json::json!({"q": "B"}),
        ])
        .await;
    let rows = dataset
        .select_rows_all(&SelectRowsOptions {
            filters: vec![Filter::Unary {
                path: "note".into(),
                op: UnaryOp::NotExists,
            }],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value["q"], serde_json::json!("B"));
}

#[tokio::test]
async fn test_sort_orders_by_key_then_row_id() {
    let project = TestProject::new();
    let dataset = project.dataset(reviews()).await;

    let asc = dataset
        .select_rows_all(&SelectRowsOptions {
            sort_by: vec!["stars".into()],
            ..SelectRowsOptions::with_columns(["stars"])
        })
        .await
        .unwrap();
    let stars: Vec<i64> = asc.iter().map(|r| r.value["stars"].as_i64().unwrap()).collect();
    assert_eq!(stars, vec![1, 3, 5, 5]);
    // Tie between the two 5-star rows breaks by row id ascending.
    let tied: Vec<&str> = asc[2..]
        .iter()
        .map(|r| r.value["__rowid__"].as_str().unwrap())
        .collect();
    assert!(tied[0] < tied[1]);

    let desc = dataset
        .select_rows_all(&SelectRowsOptions {
            sort_by: vec!["stars".into()],
            sort_order: SortOrder::Desc,
            ..SelectRowsOptions::with_columns(["stars"])
        })
        .await
        .unwrap();
    let stars: Vec<i64> = desc.iter().map(|r| r.value["stars"].as_i64().unwrap()).collect();
    assert_eq!(stars, vec![5, 5, 3, 1]);
    // Row-id tiebreak stays ascending under DESC.
    let tied: Vec<&str> = desc[..2]
        .iter()
        .map(|r| r.value["__rowid__"].as_str().unwrap())
        .collect();
    assert!(tied[0] < tied[1]);
}

#[tokio::test]
async fn test_limit_offset_pagination() {
    let project = TestProject::new();
    let dataset = project.dataset(reviews()).await;
    let page = dataset
        .select_rows_all(&SelectRowsOptions {
            sort_by: vec!["stars".into()],
            limit: Some(2),
            offset: 1,
            ..SelectRowsOptions::with_columns(["stars"])
        })
        .await
        .unwrap();
    let stars: Vec<i64> = page.iter().map(|r| r.value["stars"].as_i64().unwrap()).collect();
    assert_eq!(stars, vec![3, 5]);
}

#[tokio::test]
async fn test_flat_table_output() {
    let project = TestProject::new();
    let dataset = project
        .dataset(vec![serde_json::json!({"meta": {"stars": 4}, "q": "A"})])
        .await;
    let rows = dataset
        .select_rows_all(&SelectRowsOptions {
            combine_columns: false,
            ..SelectRowsOptions::with_columns(["q", "meta.stars"])
        })
        .await
        .unwrap();
    assert_eq!(rows[0].value["q"], serde_json::json!("A"));
    assert_eq!(rows[0].value["meta.stars"], serde_json::json!(4));
}

#[tokio::test]
async fn test_unknown_path_is_a_plan_time_error() {
    let project = TestProject::new();
    let dataset = project.dataset(reviews()).await;
    let result = dataset
        .select_rows_all(&SelectRowsOptions::with_columns(["nope"]))
        .await;
    assert!(matches!(
        result,
        Err(SiftError::Schema(SchemaError::UnknownPath { .. }))
    ));
}

#[tokio::test]
async fn test_type_mismatch_is_a_plan_time_error() {
    let project = TestProject::new();
    let dataset = project.dataset(reviews()).await;
    let result = dataset
        .select_rows_all(&SelectRowsOptions {
            filters: vec![Filter::Binary {
                path: "stars".into(),
                op: BinaryOp::RegexMatches,
                value: serde_json::json!("a+"),
            }],
            ..Default::default()
        })
        .await;
    assert!(matches!(
        result,
        Err(SiftError::Query(QueryError::TypeMismatch { .. }))
    ));
}

#[tokio::test]
async fn test_udf_column_runs_inline() {
    let project = TestProject::new();
    let dataset = project.dataset(reviews()).await;
    let rows = dataset
        .select_rows_all(&SelectRowsOptions {
            columns: Some(vec![
                Column::Path("text".into()),
                Column::Udf {
                    path: "text".into(),
                    signal: SignalDescriptor::new("lang_detection", serde_json::Value::Null),
                    alias: "lang".to_string(),
                    best_effort: false,
                },
            ]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].value["lang"], serde_json::json!("eng"));
}

#[tokio::test]
async fn test_select_rows_schema_includes_udf_columns() {
    let project = TestProject::new();
    let dataset = project.dataset(reviews()).await;
    let schema = dataset
        .select_rows_schema(&SelectRowsOptions {
            columns: Some(vec![
                Column::Path("text".into()),
                Column::Udf {
                    path: "text".into(),
                    signal: SignalDescriptor::new("lang_detection", serde_json::Value::Null),
                    alias: "lang".to_string(),
                    best_effort: false,
                },
            ]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(schema.computed_paths, vec!["lang".into()]);
    assert!(schema.data_schema.get_field(&"lang".into()).is_ok());
}

#[tokio::test]
async fn test_stats_are_computed_and_cached() {
    let project = TestProject::new();
    let dataset = project.dataset(reviews()).await;
    let stats = dataset.stats(&"stars".into()).await.unwrap();
    assert_eq!(stats.total_count, 4);
    assert_eq!(stats.approx_distinct, 3);
    assert_eq!(stats.min, Some(serde_json::json!(1)));
    assert_eq!(stats.max, Some(serde_json::json!(5)));

    let text_stats = dataset.stats(&"text".into()).await.unwrap();
    assert!(text_stats.avg_len.unwrap() > 10.0);
}
