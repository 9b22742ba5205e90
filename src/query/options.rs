//! Query configuration: projections, filters, searches, sorts.
//!
//! Filters use the tagged `Binary | Unary | List` form; the legacy
//! single-record `{path, comparison, value}` shape is deprecated and not
//! accepted.

use serde::{Deserialize, Serialize};

use crate::schema::{Path, Schema};
use crate::signals::SignalDescriptor;

/// A projected column: a plain path, or an inline UDF column that runs a
/// signal against a source path while the query streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Column {
    Path(Path),
    Udf {
        path: Path,
        signal: SignalDescriptor,
        alias: String,
        /// Failed rows yield null instead of aborting the stream.
        #[serde(default)]
        best_effort: bool,
    },
}

impl From<&str> for Column {
    fn from(s: &str) -> Self {
        Column::Path(s.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Equals,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    LengthGreater,
    LengthLess,
    RegexMatches,
}

impl BinaryOp {
    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Exists,
    NotExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListOp {
    In,
}

/// A filter condition; conditions are AND-combined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    Binary {
        path: Path,
        op: BinaryOp,
        value: serde_json::Value,
    },
    Unary {
        path: Path,
        op: UnaryOp,
    },
    List {
        path: Path,
        op: ListOp,
        values: Vec<serde_json::Value>,
    },
}

impl Filter {
    pub fn equals(path: impl Into<Path>, value: serde_json::Value) -> Self {
        Filter::Binary {
            path: path.into(),
            op: BinaryOp::Equals,
            value,
        }
    }

    pub fn exists(path: impl Into<Path>) -> Self {
        Filter::Unary {
            path: path.into(),
            op: UnaryOp::Exists,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Filter::Binary { path, .. } | Filter::Unary { path, .. } | Filter::List { path, .. } => {
                path
            }
        }
    }
}

/// A search over a text path. Each search implicitly projects a span
/// subtree and contributes a sort score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Search {
    Keyword {
        path: Path,
        query: String,
    },
    Semantic {
        path: Path,
        query: String,
        embedding: String,
    },
    Concept {
        path: Path,
        namespace: String,
        concept_name: String,
        embedding: String,
    },
}

impl Search {
    pub fn path(&self) -> &Path {
        match self {
            Search::Keyword { path, .. }
            | Search::Semantic { path, .. }
            | Search::Concept { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Closed configuration for `select_rows`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectRowsOptions {
    /// Projected columns; `None` projects everything.
    #[serde(default)]
    pub columns: Option<Vec<Column>>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub searches: Vec<Search>,
    #[serde(default)]
    pub sort_by: Vec<Path>,
    #[serde(default)]
    pub sort_order: SortOrder,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
    /// `true` yields one nested row; `false` yields a flat table keyed by
    /// dotted petal paths.
    #[serde(default = "default_true")]
    pub combine_columns: bool,
    #[serde(default)]
    pub include_labels: Vec<String>,
    #[serde(default)]
    pub exclude_labels: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for SelectRowsOptions {
    fn default() -> Self {
        Self {
            columns: None,
            filters: Vec::new(),
            searches: Vec::new(),
            sort_by: Vec::new(),
            sort_order: SortOrder::Asc,
            limit: None,
            offset: 0,
            combine_columns: true,
            include_labels: Vec::new(),
            exclude_labels: Vec::new(),
        }
    }
}

impl SelectRowsOptions {
    pub fn with_columns<I, C>(columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Column>,
    {
        Self {
            columns: Some(columns.into_iter().map(Into::into).collect()),
            combine_columns: true,
            ..Default::default()
        }
    }
}

/// One streamed result row, JSON-shaped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectedRow {
    pub row_id: String,
    pub value: serde_json::Value,
}

/// Resolved schema of a `select_rows` call, including UDF and search
/// columns.
#[derive(Debug, Clone, Serialize)]
pub struct SelectRowsSchema {
    pub data_schema: Schema,
    /// Paths added by UDF columns and searches, in plan order.
    pub computed_paths: Vec<Path>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_serde_tagged_form() {
        let filter = Filter::equals("meta.source", serde_json::json!("bar"));
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["type"], "binary");
        assert_eq!(json["op"], "equals");
        let back: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(back, filter);
    }

    #[test]
    fn test_legacy_filter_form_rejected() {
        let legacy = serde_json::json!({"path": "x", "comparison": "equals", "value": 1});
        assert!(serde_json::from_value::<Filter>(legacy).is_err());
    }

    #[test]
    fn test_search_serde() {
        let search: Search = serde_json::from_value(serde_json::json!({
            "type": "semantic", "path": "text", "query": "treasure hunt", "embedding": "hash128"
        }))
        .unwrap();
        assert_eq!(
            search,
            Search::Semantic {
                path: "text".into(),
                query: "treasure hunt".to_string(),
                embedding: "hash128".to_string(),
            }
        );
    }

    #[test]
    fn test_sort_order_serde_uppercase() {
        assert_eq!(serde_json::to_string(&SortOrder::Desc).unwrap(), "\"DESC\"");
    }

    #[test]
    fn test_column_untagged_serde() {
        let column: Column = serde_json::from_value(serde_json::json!("text.pii")).unwrap();
        assert_eq!(column, Column::Path("text.pii".into()));
        let udf: Column = serde_json::from_value(serde_json::json!({
            "path": "text",
            "signal": {"name": "lang_detection"},
            "alias": "lang"
        }))
        .unwrap();
        assert!(matches!(udf, Column::Udf { best_effort: false, .. }));
    }
}
