//! Enrichment pipeline: batched, parallel, resumable execution of maps
//! and signals over a dataset, writing new immutable shards beside the
//! source.

pub mod executor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SiftError;
use crate::query::options::Filter;
use crate::schema::{Path, Value};

/// Cooperative cancellation handle. Checked at batch boundaries: on
/// cancel, in-flight batches drain and their results are flushed so the
/// completed bitmap stays truthful, then the call returns `Cancelled`.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Requested execution backend.
///
/// Both variants run on the same OS-thread worker pool: Rust threads
/// parallelize CPU-bound work, so a separate process pool buys nothing
/// here. `Processes` is accepted for interface parity and logs a warning.
/// Signal configuration is passed by value into each worker task, so no
/// worker relies on shared mutable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Execution {
    #[default]
    Threads,
    Processes,
}

/// Options for `map` and the signal/embedding/concept wrappers over it.
#[derive(Clone)]
pub struct MapOptions {
    /// Input path the function consumes; `None` means the whole row.
    /// A wildcard path presents the function with a flat stream of leaf
    /// values; the output mirrors the input nesting on write.
    pub input_path: Option<Path>,
    /// Name of the output column.
    pub output_column: Option<String>,
    /// Parent path the output nests under; defaults to the top level for
    /// maps and to the source path for signals.
    pub nest_under: Option<Path>,
    /// Rows per function call; `-1` presents the whole input as one batch.
    pub batch_size: i64,
    pub execution: Execution,
    /// Worker pool size.
    pub num_jobs: usize,
    /// Restrict processing to matching rows; the rest get nulls.
    pub filters: Vec<Filter>,
    /// Process at most this many matching rows.
    pub limit: Option<usize>,
    /// Recompute even if an identical enrichment exists.
    pub overwrite: bool,
    /// Resume from the completed bitmap instead of starting over.
    pub resumable: bool,
    /// Abort once more than this many rows error; `None` = unbounded.
    pub max_errors: Option<usize>,
    pub cancel: Option<CancelHandle>,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            input_path: None,
            output_column: None,
            nest_under: None,
            batch_size: 1,
            execution: Execution::Threads,
            num_jobs: 4,
            filters: Vec::new(),
            limit: None,
            overwrite: false,
            resumable: true,
            max_errors: None,
            cancel: None,
        }
    }
}

/// A user map function: called with a batch of inputs, returns a batch of
/// outputs of equal length; `None` outputs mean missing. Treated as an
/// opaque blocking call and run on the blocking pool.
pub type MapFn = Arc<dyn Fn(&[Value]) -> Result<Vec<Option<Value>>, SiftError> + Send + Sync>;

/// Outcome of an enrichment run.
#[derive(Debug)]
pub struct MapResult {
    /// Full path of the written column in the merged schema.
    pub output_path: Path,
    /// Rows processed in this call (resumed rows excluded).
    pub num_processed: usize,
    /// Rows whose function call errored; their output slots are null.
    pub num_errors: usize,
    /// Outputs for targeted rows in source order, nesting mirrored for
    /// flattened inputs.
    pub values: Vec<Value>,
}

/// One row-level error recorded in the sidecar file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowError {
    pub row_id: String,
    pub message: String,
}
