use thiserror::Error;

/// Schema construction and path-resolution errors.
///
/// These indicate programmer error (ill-formed schemas, bad paths) and are
/// never recovered at runtime.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// A field declared a dtype the schema model does not know.
    #[error("Invalid dtype '{dtype}' at '{path}'")]
    InvalidDtype { dtype: String, path: String },

    /// A node populated more than one of dtype / fields / repeated_field.
    #[error("Field '{path}' must have exactly one of dtype, fields, or repeated_field")]
    ChildrenConflict { path: String },

    /// A span or embedding field with no string anchor to attach to.
    #[error("Span field '{path}' has no string ancestor to anchor to")]
    OrphanSpan { path: String },

    /// Path lookup failed.
    #[error("Unknown path '{path}'")]
    UnknownPath { path: String },
}

/// Query planning and row-stream errors.
#[derive(Debug, Error)]
pub enum QueryError {
    /// A filter or sort op was applied to a value of an incompatible dtype.
    #[error("Type mismatch at '{path}': {message}")]
    TypeMismatch { path: String, message: String },

    /// The op is not supported for the path's dtype.
    #[error("Unknown or unsupported op '{op}' for path '{path}'")]
    UnknownOp { op: String, path: String },

    /// A search operator was requested over a path that cannot serve it,
    /// e.g. semantic search without a materialized embedding column.
    #[error("Search is not supported for path '{path}': {message}")]
    UnsupportedSearchForPath { path: String, message: String },

    /// An inline UDF column failed while the stream was being produced.
    #[error("UDF column '{alias}' failed: {source}")]
    Udf {
        alias: String,
        #[source]
        source: Box<SiftError>,
    },
}

/// Enrichment pipeline errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The input stream ended before the expected number of outputs.
    #[error("Input exhausted after {processed} of {expected} rows")]
    InputExhausted { processed: usize, expected: usize },

    /// A worker task panicked; the listed rows were in flight.
    #[error("Worker crashed while processing {} rows", row_ids.len())]
    WorkerCrash { row_ids: Vec<String> },

    /// The operation was cancelled. In-flight batches were drained and
    /// flushed before returning; the completed bitmap stays truthful.
    #[error("Operation cancelled")]
    Cancelled,

    /// More per-row errors than max_errors allows.
    #[error("Row error threshold exceeded: {errors} errors (max {max_errors})")]
    RowErrorThresholdExceeded { errors: usize, max_errors: usize },

    /// Writing a shard part failed. Always aborts the job.
    #[error("Shard write failed: {0}")]
    ShardWrite(#[source] std::io::Error),

    /// The output column already exists with a different descriptor.
    #[error("Output column '{path}' already exists (pass overwrite to replace it)")]
    OutputColumnExists { path: String },
}

/// Concept store and scorer errors.
#[derive(Debug, Error)]
pub enum ConceptError {
    /// Training requires at least one negative example.
    #[error("Concept '{namespace}/{name}' cannot train: needs at least one negative example")]
    NeedsNegatives { namespace: String, name: String },

    /// Training requires at least one positive example.
    #[error("Concept '{namespace}/{name}' cannot train: needs at least one positive example")]
    NeedsPositives { namespace: String, name: String },

    /// The vectors handed to a model do not match its embedding dimensions.
    #[error("Embedding mismatch for '{namespace}/{name}': model expects {expected} dims, got {actual}")]
    EmbeddingMismatch {
        namespace: String,
        name: String,
        expected: usize,
        actual: usize,
    },

    /// No such concept.
    #[error("Concept '{namespace}/{name}' not found")]
    NotFound { namespace: String, name: String },

    /// An edit raced a newer version of the concept.
    #[error("Concept '{namespace}/{name}' is stale: expected version {expected}, found {actual}")]
    VersionStale {
        namespace: String,
        name: String,
        expected: u64,
        actual: u64,
    },
}

/// Storage-layer errors. Indicate disk damage or lock contention and are
/// never recovered.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Manifest corrupt at '{path}': {message}")]
    ManifestCorrupt { path: String, message: String },

    #[error("Shard corrupt at '{path}': {message}")]
    ShardCorrupt { path: String, message: String },

    #[error("Dataset lock unavailable: {0}")]
    LockUnavailable(String),
}

/// Top-level error type for sift operations.
#[derive(Debug, Error)]
pub enum SiftError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Concept(#[from] ConceptError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No embedding registered under this name.
    #[error("Unknown embedding '{0}'")]
    UnknownEmbedding(String),

    /// No such dataset under the project directory.
    #[error("Dataset '{namespace}/{name}' not found")]
    DatasetNotFound { namespace: String, name: String },

    /// Input validation failed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O outside the shard write path (project dirs, small stores).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization of manifests and small stores.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<arrow::error::ArrowError> for SiftError {
    fn from(err: arrow::error::ArrowError) -> Self {
        SiftError::Storage(StorageError::ShardCorrupt {
            path: String::new(),
            message: err.to_string(),
        })
    }
}

impl From<parquet::errors::ParquetError> for SiftError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        SiftError::Storage(StorageError::ShardCorrupt {
            path: String::new(),
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_errors_lift_into_sift_error() {
        let err: SiftError = SchemaError::UnknownPath {
            path: "nope".to_string(),
        }
        .into();
        assert!(matches!(err, SiftError::Schema(SchemaError::UnknownPath { .. })));
        assert_eq!(err.to_string(), "Unknown path 'nope'");
    }

    #[test]
    fn test_cancelled_is_not_success() {
        let err: SiftError = PipelineError::Cancelled.into();
        assert_eq!(err.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_udf_error_carries_inner() {
        let inner = SiftError::Validation("bad input".to_string());
        let err = QueryError::Udf {
            alias: "lang".to_string(),
            source: Box::new(inner),
        };
        assert!(err.to_string().contains("lang"));
        assert!(err.to_string().contains("bad input"));
    }
}
