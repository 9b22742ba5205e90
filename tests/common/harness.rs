//! Test harness for project lifecycle management.
//!
//! Provides isolated project directories per test using tempfile.

use std::sync::Arc;

use tempfile::TempDir;

use sift::dataset::Dataset;
use sift::init::AppContext;
use sift::pipeline::{MapFn, MapOptions};
use sift::schema::Value;

/// Test harness owning an isolated project directory.
///
/// The directory is cleaned up when the harness is dropped.
pub struct TestProject {
    pub ctx: AppContext,
    pub temp_dir: TempDir,
}

impl TestProject {
    /// Create a new test project in a temporary directory.
    ///
    /// Panics on failure (appropriate for tests).
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory for test project");
        let ctx = AppContext::new(Some(temp_dir.path().to_path_buf()))
            .expect("Failed to initialize test project");
        Self { ctx, temp_dir }
    }

    /// Create a dataset named local/test from the given items.
    pub async fn dataset(&self, items: Vec<serde_json::Value>) -> Dataset {
        self.ctx
            .create_dataset("local", "test", &items, None)
            .await
            .expect("Failed to create test dataset")
    }
}

/// A map fn that prefixes string inputs, mirroring the docs' "Q: " demo.
pub fn prefix_fn(prefix: &str) -> MapFn {
    let prefix = prefix.to_string();
    Arc::new(move |inputs: &[Value]| {
        Ok(inputs
            .iter()
            .map(|v| v.as_str().map(|s| Value::string(format!("{prefix}{s}"))))
            .collect())
    })
}

/// MapOptions with the output column set, defaults otherwise.
pub fn map_options(output_column: &str) -> MapOptions {
    MapOptions {
        output_column: Some(output_column.to_string()),
        ..Default::default()
    }
}
