//! Dataset manifest: the authoritative index of source schema and
//! enrichments.
//!
//! The manifest is a JSON document replaced atomically on every update.
//! Writers serialize behind a per-dataset lock; readers clone an `Arc`
//! snapshot at call entry and never observe partial updates. The manifest
//! is also the single arbiter of lineage: derived paths point back at
//! their source path here, never in the schema value graph.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SiftError, StorageError};
use crate::schema::{Field, Path, Schema};
use crate::signals::SignalDescriptor;
use crate::utils::fs::{atomic_write_json, read_json};

pub const MANIFEST_FILE: &str = "manifest.json";

/// One enrichment's manifest record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentEntry {
    /// Where the output nests in the merged schema, e.g. `text.pii`.
    pub output_path: Path,
    /// The input path it was computed from, e.g. `text` or `qs.*`.
    pub source_path: Path,
    /// Producing signal, for lineage and idempotence.
    pub signal: SignalDescriptor,
    /// Schema of the output subtree.
    pub output_field: Field,
    /// Shard directory, relative to the dataset directory.
    pub shard_dir: String,
    /// Completed-bitmap file, relative to the dataset directory.
    pub bitmap_file: String,
    /// Error-sidecar file, relative to the dataset directory.
    pub errors_file: String,
    /// Rows durably written so far.
    pub num_items: usize,
    pub created_at: DateTime<Utc>,
}

/// The manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub namespace: String,
    pub name: String,
    pub source_schema: Schema,
    pub num_rows: usize,
    pub enrichments: Vec<EnrichmentEntry>,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    pub fn find_enrichment(&self, output_path: &Path) -> Option<&EnrichmentEntry> {
        self.enrichments.iter().find(|e| &e.output_path == output_path)
    }

    /// Source schema with every enrichment subtree attached under its
    /// output path.
    pub fn merged_schema(&self) -> Result<Schema, SiftError> {
        let mut schema = self.source_schema.clone();
        for entry in &self.enrichments {
            let Some(parent) = entry.output_path.parent() else {
                continue;
            };
            let Some(crate::schema::PathSegment::Name(name)) = entry.output_path.last() else {
                continue;
            };
            let mut field = entry.output_field.clone();
            field.signal = Some(entry.signal.clone());
            schema.attach(&parent, name, field)?;
        }
        Ok(schema)
    }
}

/// Filesystem name for an enrichment's shard directory.
pub fn sanitize_path_name(path: &Path) -> String {
    path.to_string()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Serialized-writer, snapshot-reader manifest store.
pub struct ManifestStore {
    path: PathBuf,
    current: RwLock<Arc<Manifest>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ManifestStore {
    /// Write a fresh manifest and open a store over it.
    pub fn create(path: impl Into<PathBuf>, manifest: Manifest) -> Result<Self, SiftError> {
        let path = path.into();
        atomic_write_json(&path, &manifest)?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(manifest)),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Open an existing manifest.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SiftError> {
        let path = path.into();
        let manifest: Manifest = read_json(&path).map_err(|e| {
            SiftError::Storage(StorageError::ManifestCorrupt {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        })?;
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(manifest)),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Snapshot of the manifest as of now. Queries hold one snapshot for
    /// their whole lifetime.
    pub fn snapshot(&self) -> Arc<Manifest> {
        self.current
            .read()
            .expect("manifest snapshot lock poisoned")
            .clone()
    }

    /// Apply a mutation under the writer lock, persist atomically, then
    /// publish the new snapshot. The durable write is the serialization
    /// point: readers that began earlier keep their pre-commit view.
    pub async fn update<F>(&self, mutate: F) -> Result<Arc<Manifest>, SiftError>
    where
        F: FnOnce(&mut Manifest),
    {
        let _guard = self.write_lock.lock().await;
        let mut manifest = (*self.snapshot()).clone();
        mutate(&mut manifest);
        atomic_write_json(&self.path, &manifest)?;
        let published = Arc::new(manifest);
        *self
            .current
            .write()
            .expect("manifest snapshot lock poisoned") = published.clone();
        Ok(published)
    }
}
