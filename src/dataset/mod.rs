//! Datasets: immutable source shards plus layered enrichments, labels,
//! and the query surface over the merged view.

pub mod arrow_conv;
pub mod bitmap;
pub mod labels;
pub mod manifest;
pub mod shard;
pub mod stats;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use tracing::info;

use crate::dataset::arrow_conv::ShardRow;
use crate::dataset::labels::{LabelStore, LABELS_FILE};
use crate::dataset::manifest::{Manifest, ManifestStore, MANIFEST_FILE};
use crate::dataset::shard::{single_column, ShardReader, ShardWriter};
use crate::dataset::stats::{compute_stats, ColumnStats};
use crate::error::{PipelineError, QueryError, SiftError};
use crate::pipeline::executor::{run_enrichment, Computer, JobContext, PreparedRow};
use crate::pipeline::{MapFn, MapOptions, MapResult};
use crate::query::engine::{self, MergedRow, QueryContext};
use crate::query::options::{SelectRowsOptions, SelectRowsSchema, SelectedRow};
use crate::schema::value::assemble_from_elements;
use crate::schema::{infer_schema, Field, Path, PathSegment, Schema, Value};
use crate::signals::{SignalDescriptor, SignalRegistry};

const SOURCE_DIR: &str = "source";
const CREATE_PART_ROWS: usize = 1024;

/// Rows the caller wants labeled.
pub enum LabelSelection {
    RowIds(Vec<String>),
    /// Rows matching a query.
    Query(Box<SelectRowsOptions>),
}

/// An open dataset under a project directory.
pub struct Dataset {
    namespace: String,
    name: String,
    dir: PathBuf,
    manifest: Arc<ManifestStore>,
    labels: Arc<LabelStore>,
    signals: Arc<SignalRegistry>,
    stats_cache: moka::future::Cache<String, Arc<ColumnStats>>,
}

impl Dataset {
    /// Materialize a dataset from parsed items; source shards are written
    /// once and never rewritten.
    pub async fn create(
        dir: impl Into<PathBuf>,
        namespace: &str,
        name: &str,
        items: &[serde_json::Value],
        schema: Option<Schema>,
        signals: Arc<SignalRegistry>,
    ) -> Result<Self, SiftError> {
        let dir = dir.into();
        if dir.join(MANIFEST_FILE).exists() {
            return Err(SiftError::Validation(format!(
                "dataset '{namespace}/{name}' already exists"
            )));
        }
        let schema = match schema {
            Some(schema) => {
                schema.validate()?;
                schema
            }
            None => infer_schema(items)?,
        };

        std::fs::create_dir_all(&dir)?;
        let columns: Vec<(String, Field)> = schema
            .fields
            .iter()
            .map(|(n, f)| (n.clone(), f.clone()))
            .collect();
        let mut writer = ShardWriter::open(dir.join(SOURCE_DIR), columns.clone())?;
        let mut buffer: Vec<ShardRow> = Vec::with_capacity(CREATE_PART_ROWS);
        for (i, item) in items.iter().enumerate() {
            let mut values = BTreeMap::new();
            for (field_name, field) in &schema.fields {
                let json = item.get(field_name).unwrap_or(&serde_json::Value::Null);
                values.insert(field_name.clone(), Value::from_json(field, json)?);
            }
            buffer.push(ShardRow::new(row_id_for(i), values));
            if buffer.len() >= CREATE_PART_ROWS {
                writer.write_part(&buffer)?;
                buffer.clear();
            }
        }
        writer.write_part(&buffer)?;

        let manifest = Manifest {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source_schema: schema,
            num_rows: items.len(),
            enrichments: Vec::new(),
            created_at: Utc::now(),
        };
        let manifest = Arc::new(ManifestStore::create(dir.join(MANIFEST_FILE), manifest)?);
        let labels = Arc::new(LabelStore::load_or_create(dir.join(LABELS_FILE))?);
        info!("Created dataset {namespace}/{name} with {} rows", items.len());
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            dir,
            manifest,
            labels,
            signals,
            stats_cache: moka::future::Cache::new(256),
        })
    }

    /// Open an existing dataset.
    pub fn open(
        dir: impl Into<PathBuf>,
        namespace: &str,
        name: &str,
        signals: Arc<SignalRegistry>,
    ) -> Result<Self, SiftError> {
        let dir = dir.into();
        if !dir.join(MANIFEST_FILE).exists() {
            return Err(SiftError::DatasetNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        let manifest = Arc::new(ManifestStore::load(dir.join(MANIFEST_FILE))?);
        let labels = Arc::new(LabelStore::load_or_create(dir.join(LABELS_FILE))?);
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            dir,
            manifest,
            labels,
            signals,
            stats_cache: moka::future::Cache::new(256),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_rows(&self) -> usize {
        self.manifest.snapshot().num_rows
    }

    pub fn manifest(&self) -> Arc<Manifest> {
        self.manifest.snapshot()
    }

    pub fn labels(&self) -> &Arc<LabelStore> {
        &self.labels
    }

    /// The source schema with all enrichments attached.
    pub fn merged_schema(&self) -> Result<Schema, SiftError> {
        self.manifest.snapshot().merged_schema()
    }

    // ------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------

    fn load_merged_rows(&self, snapshot: &Manifest) -> Result<Vec<MergedRow>, SiftError> {
        let columns: Vec<(String, Field)> = snapshot
            .source_schema
            .fields
            .iter()
            .map(|(n, f)| (n.clone(), f.clone()))
            .collect();
        let reader = ShardReader::open(self.dir.join(SOURCE_DIR), columns);
        let mut rows: Vec<MergedRow> = Vec::with_capacity(snapshot.num_rows);
        for row in reader.scan()? {
            let row = row?;
            rows.push(MergedRow {
                row_id: row.row_id,
                source: Value::Struct(row.values),
                enrichments: BTreeMap::new(),
            });
        }

        for entry in &snapshot.enrichments {
            let reader = ShardReader::open(
                self.dir.join(&entry.shard_dir),
                single_column(entry.output_field.clone()),
            );
            let mut by_row: HashMap<String, Vec<(Vec<u32>, Value)>> = HashMap::new();
            for shard_row in reader.scan()? {
                let shard_row = shard_row?;
                by_row
                    .entry(shard_row.row_id.clone())
                    .or_default()
                    .push((shard_row.index.clone(), shard_row.value().clone()));
            }
            for row in rows.iter_mut() {
                let value = match by_row.remove(&row.row_id) {
                    None => Value::Null,
                    Some(mut items) => {
                        if items.len() == 1 && items[0].0.is_empty() {
                            items.pop().expect("len checked").1
                        } else {
                            assemble_from_elements(items)
                        }
                    }
                };
                row.enrichments.insert(entry.output_path.clone(), value);
            }
        }
        Ok(rows)
    }

    fn query_context<'a>(
        &'a self,
        snapshot: Arc<Manifest>,
    ) -> Result<QueryContext<'a>, SiftError> {
        Ok(QueryContext {
            merged_schema: snapshot.merged_schema()?,
            manifest: snapshot,
            labels: self.labels.as_ref(),
            signals: self.signals.as_ref(),
        })
    }

    /// Stream rows matching the options, in `(sort, row_id)` order. The
    /// manifest snapshot is taken at call entry; concurrent enrichments
    /// do not affect a running query.
    pub async fn select_rows(
        &self,
        options: &SelectRowsOptions,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<SelectedRow, SiftError>> + Send>>, SiftError>
    {
        let rows = self.select_rows_all(options).await?;
        Ok(Box::pin(async_stream::try_stream! {
            for row in rows {
                yield row;
            }
        }))
    }

    /// `select_rows`, collected.
    pub async fn select_rows_all(
        &self,
        options: &SelectRowsOptions,
    ) -> Result<Vec<SelectedRow>, SiftError> {
        let snapshot = self.manifest.snapshot();
        let rows = self.load_merged_rows(&snapshot)?;
        let ctx = self.query_context(snapshot)?;
        engine::select_rows(&ctx, rows, options).await
    }

    /// Resolved nested schema of a query, UDF and search columns included.
    pub async fn select_rows_schema(
        &self,
        options: &SelectRowsOptions,
    ) -> Result<SelectRowsSchema, SiftError> {
        let snapshot = self.manifest.snapshot();
        let ctx = self.query_context(snapshot)?;
        engine::select_rows_schema(&ctx, options).await
    }

    /// Lazily computed, cached stats for one column path.
    pub async fn stats(&self, path: &Path) -> Result<Arc<ColumnStats>, SiftError> {
        let key = path.to_string();
        if let Some(stats) = self.stats_cache.get(&key).await {
            return Ok(stats);
        }
        let snapshot = self.manifest.snapshot();
        snapshot.merged_schema()?.get_field(path)?;
        let rows = self.load_merged_rows(&snapshot)?;
        let mut values = Vec::new();
        for row in &rows {
            values.extend(row.resolve_values(path));
        }
        let stats = Arc::new(compute_stats(values));
        self.stats_cache.insert(key, stats.clone()).await;
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Enrichment
    // ------------------------------------------------------------------

    /// Apply a user function over the value stream at `input_path`,
    /// writing one output per input value into a new column.
    pub async fn map(&self, map_fn: MapFn, options: MapOptions) -> Result<MapResult, SiftError> {
        let output_column = options.output_column.clone().ok_or_else(|| {
            SiftError::Validation("map requires an output_column".to_string())
        })?;
        let output_path = match &options.nest_under {
            Some(parent) => parent.child_name(output_column.clone()),
            None => Path::field(output_column.clone()),
        };
        let descriptor = SignalDescriptor::new(
            "map",
            serde_json::json!({
                "output_column": output_column,
                "input_path": options.input_path.as_ref().map(|p| p.to_string()),
            }),
        );
        self.run_job(
            descriptor,
            options.input_path.clone().unwrap_or_default(),
            output_path,
            None,
            false,
            Computer::Map(map_fn),
            options,
        )
        .await
    }

    /// Run a registered signal over `path`; the output nests under the
    /// source path. Identical reruns are no-ops unless `overwrite`.
    pub async fn compute_signal(
        &self,
        descriptor: &SignalDescriptor,
        path: &Path,
        options: MapOptions,
    ) -> Result<MapResult, SiftError> {
        let signal = self.signals.resolve(descriptor)?;
        let merged = self.merged_schema()?;
        let field = merged.get_field(path)?;
        if let (Some(dtype), crate::signals::SignalInputType::Text) =
            (field.dtype, signal.input_type())
        {
            if !signal.accepts(dtype) {
                return Err(QueryError::TypeMismatch {
                    path: path.to_string(),
                    message: format!(
                        "signal '{}' does not accept dtype {dtype}",
                        descriptor.name
                    ),
                }
                .into());
            }
        }
        let column = options
            .output_column
            .clone()
            .unwrap_or_else(|| signal.default_column_name());
        let parent = options.nest_under.clone().unwrap_or_else(|| path.clone());
        let output_path = parent.child_name(column);
        self.run_job(
            signal.descriptor(),
            path.clone(),
            output_path,
            Some(signal.output_schema()),
            true,
            Computer::Signal(signal),
            options,
        )
        .await
    }

    /// Chunk and embed the text at `path` with a named embedding; the
    /// chunker is the embedding's own.
    pub async fn compute_embedding(
        &self,
        embedding: &str,
        path: &Path,
    ) -> Result<MapResult, SiftError> {
        // Resolve eagerly so unknown names fail before any execution.
        self.signals.embeddings().get(embedding)?;
        let descriptor = SignalDescriptor::new(
            crate::signals::embedding_signal::EMBEDDING_NAME,
            serde_json::json!({ "embedding": embedding }),
        );
        self.compute_signal(
            &descriptor,
            path,
            MapOptions {
                batch_size: 32,
                ..Default::default()
            },
        )
        .await
    }

    /// Score every embedded chunk of `path.embedding` with a trained
    /// concept model, writing `{span, score}` per chunk under
    /// `path.<namespace>/<name>/<embedding>`.
    pub async fn compute_concept(
        &self,
        namespace: &str,
        concept_name: &str,
        embedding: &str,
        path: &Path,
    ) -> Result<MapResult, SiftError> {
        let embedding_path = path.child_name(embedding.to_string());
        let snapshot = self.manifest.snapshot();
        if snapshot.find_enrichment(&embedding_path).is_none() {
            return Err(SiftError::Validation(format!(
                "no embedding column at '{embedding_path}'; run compute_embedding('{embedding}', '{path}') first"
            )));
        }
        let descriptor = SignalDescriptor::new(
            crate::signals::embedding_signal::CONCEPT_SCORE_NAME,
            serde_json::json!({
                "namespace": namespace,
                "concept_name": concept_name,
                "embedding": embedding,
            }),
        );
        self.compute_signal(
            &descriptor,
            &embedding_path,
            MapOptions {
                nest_under: Some(path.clone()),
                batch_size: 64,
                ..Default::default()
            },
        )
        .await
    }

    /// Remove an enrichment as a unit: shard, bitmap, manifest entry.
    /// The source is untouched.
    pub async fn delete_enrichment(&self, output_path: &Path) -> Result<(), SiftError> {
        let snapshot = self.manifest.snapshot();
        let Some(entry) = snapshot.find_enrichment(output_path) else {
            return Err(SiftError::Schema(crate::error::SchemaError::UnknownPath {
                path: output_path.to_string(),
            }));
        };
        let shard_dir = self.dir.join(&entry.shard_dir);
        if shard_dir.exists() {
            std::fs::remove_dir_all(&shard_dir)?;
        }
        let output_path = output_path.clone();
        self.manifest
            .update(move |m| m.enrichments.retain(|e| e.output_path != output_path))
            .await?;
        self.stats_cache.invalidate_all();
        Ok(())
    }

    async fn run_job(
        &self,
        descriptor: SignalDescriptor,
        source_path: Path,
        output_path: Path,
        output_field: Option<Field>,
        idempotent: bool,
        computer: Computer,
        options: MapOptions,
    ) -> Result<MapResult, SiftError> {
        let snapshot = self.manifest.snapshot();
        if snapshot.source_schema.has_path(&output_path) {
            return Err(PipelineError::OutputColumnExists {
                path: output_path.to_string(),
            }
            .into());
        }

        let rows = self.load_merged_rows(&snapshot)?;
        let prepared = self.prepare_rows(&snapshot, &rows, &source_path, &options)?;

        let result = run_enrichment(
            JobContext {
                dataset_dir: self.dir.clone(),
                manifest: self.manifest.clone(),
                descriptor,
                source_path,
                output_path,
                output_field,
                idempotent,
                computer,
                options,
            },
            prepared,
        )
        .await?;
        self.stats_cache.invalidate_all();
        Ok(result)
    }

    /// Target rows with filters/limit and flatten their inputs.
    fn prepare_rows(
        &self,
        snapshot: &Manifest,
        rows: &[MergedRow],
        source_path: &Path,
        options: &MapOptions,
    ) -> Result<Vec<PreparedRow>, SiftError> {
        let merged_schema = snapshot.merged_schema()?;
        let compiled: Vec<engine::CompiledFilter> = options
            .filters
            .iter()
            .map(|f| engine::compile_filter(&merged_schema, f))
            .collect::<Result<_, _>>()?;

        let mut remaining = options.limit.unwrap_or(usize::MAX);
        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let passes = remaining > 0
                && compiled
                    .iter()
                    .all(|f| engine::eval_filter(row, &self.labels, f));
            if passes {
                remaining -= 1;
            }
            let items = if !passes {
                Vec::new()
            } else if source_path.is_empty() {
                vec![(Vec::new(), row.source.clone())]
            } else if source_path.has_wildcard() {
                resolve_with_indices(row, source_path)
            } else {
                vec![(Vec::new(), row.value_at(source_path))]
            };
            prepared.push(PreparedRow {
                row_id: row.row_id.clone(),
                targeted: passes,
                items,
            });
        }
        Ok(prepared)
    }

    // ------------------------------------------------------------------
    // Labels
    // ------------------------------------------------------------------

    /// Apply a label to a row selection; returns how many rows changed.
    pub async fn add_labels(
        &self,
        label_name: &str,
        selection: LabelSelection,
    ) -> Result<usize, SiftError> {
        let row_ids = self.selection_row_ids(selection).await?;
        self.labels.add(label_name, &row_ids)
    }

    /// Remove a label from a row selection; returns how many rows changed.
    pub async fn remove_labels(
        &self,
        label_name: &str,
        selection: LabelSelection,
    ) -> Result<usize, SiftError> {
        let row_ids = self.selection_row_ids(selection).await?;
        self.labels.remove(label_name, &row_ids)
    }

    async fn selection_row_ids(&self, selection: LabelSelection) -> Result<Vec<String>, SiftError> {
        match selection {
            LabelSelection::RowIds(ids) => Ok(ids),
            LabelSelection::Query(options) => {
                let rows = self.select_rows_all(&options).await?;
                Ok(rows.into_iter().map(|r| r.row_id).collect())
            }
        }
    }
}

/// Row ids are opaque, stable, and ascend in insertion order.
fn row_id_for(index: usize) -> String {
    format!("{index:012x}")
}

/// Concrete matches of a wildcard path with the indices taken at each
/// wildcard position.
fn resolve_with_indices(row: &MergedRow, path: &Path) -> Vec<(Vec<u32>, Value)> {
    let wildcard_positions: Vec<usize> = path
        .segments()
        .iter()
        .enumerate()
        .filter(|(_, s)| **s == PathSegment::Wildcard)
        .map(|(i, _)| i)
        .collect();
    row.source
        .resolve(path)
        .into_iter()
        .map(|(concrete, value)| {
            let indices = wildcard_positions
                .iter()
                .filter_map(|i| match concrete.segments().get(*i) {
                    Some(PathSegment::Index(n)) => Some(*n),
                    _ => None,
                })
                .collect();
            (indices, value.clone())
        })
        .collect()
}
