//! The enrichment executor.
//!
//! Runs a map function or signal over a dataset's rows: batches the
//! (optionally flattened) input stream, computes batches on a bounded
//! worker pool, reassembles results in source order, and flushes them as
//! durable shard parts with part-first / bitmap-next / manifest-last
//! ordering. Guarantees at-most-once writes per row, resumability from
//! the completed bitmap, backpressure through the bounded stream, and
//! cooperative cancellation at batch boundaries.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tracing::{info, warn};

use crate::dataset::arrow_conv::ShardRow;
use crate::dataset::bitmap::CompletedBitmap;
use crate::dataset::manifest::{sanitize_path_name, EnrichmentEntry, ManifestStore};
use crate::dataset::shard::{single_column, ShardWriter};
use crate::error::{PipelineError, SiftError};
use crate::pipeline::{Execution, MapFn, MapOptions, MapResult, RowError};
use crate::schema::value::assemble_from_elements;
use crate::schema::{DType, Field, Path, Scalar, Value};
use crate::signals::{ChunkVector, Signal, SignalDescriptor, SignalInput, SignalInputType};
use crate::utils::fs::{atomic_write_json, read_json};

/// Source rows are flushed to a shard part in groups of this many.
const FLUSH_ROWS: usize = 1024;

/// What the executor runs per batch.
pub(crate) enum Computer {
    Map(MapFn),
    Signal(Arc<dyn Signal>),
}

/// One source row prepared for the executor: its flat input items
/// (`(index-path, value)`; a single `([], value)` when not flattened) and
/// whether filters/limit targeted it.
pub(crate) struct PreparedRow {
    pub row_id: String,
    pub targeted: bool,
    pub items: Vec<(Vec<u32>, Value)>,
}

/// Everything an enrichment run needs besides the rows.
pub(crate) struct JobContext {
    pub dataset_dir: PathBuf,
    pub manifest: Arc<ManifestStore>,
    pub descriptor: SignalDescriptor,
    pub source_path: Path,
    pub output_path: Path,
    /// Known upfront for signals; inferred from outputs for maps.
    pub output_field: Option<Field>,
    /// Identical-descriptor reruns are no-ops (signals) vs errors (maps).
    pub idempotent: bool,
    pub computer: Computer,
    pub options: MapOptions,
}

enum ItemResult {
    Value(Option<Value>),
    Error(String),
}

enum BatchOutcome {
    Done(Vec<ItemResult>),
    Cancelled,
    Crash(Vec<String>),
    LengthMismatch { expected: usize, actual: usize },
}

struct Batch {
    /// `(row_pos, item_pos)` pairs, parallel to the inputs.
    slots: Vec<(usize, usize)>,
    inputs: Vec<Value>,
    row_ids: Vec<String>,
}

pub(crate) async fn run_enrichment(
    ctx: JobContext,
    rows: Vec<PreparedRow>,
) -> Result<MapResult, SiftError> {
    let JobContext {
        dataset_dir,
        manifest,
        descriptor,
        source_path,
        output_path,
        output_field,
        idempotent,
        computer,
        options,
    } = ctx;
    let shard_dir_rel = format!("enrichments/{}", sanitize_path_name(&output_path));
    let shard_dir = dataset_dir.join(&shard_dir_rel);
    let bitmap_rel = format!("{shard_dir_rel}/completed.json");
    let errors_rel = format!("{shard_dir_rel}/errors.json");

    if matches!(options.execution, Execution::Processes) {
        warn!("execution=processes runs on the thread pool; see MapOptions docs");
    }

    // Reconcile with any existing enrichment at this output path.
    let mut known_field = output_field.clone();
    let mut entry_committed = false;
    let snapshot = manifest.snapshot();
    if let Some(entry) = snapshot.find_enrichment(&output_path) {
        let same = entry.signal == descriptor;
        if options.overwrite {
            delete_enrichment_files(&manifest, &output_path, &shard_dir).await?;
        } else if same {
            let bitmap = CompletedBitmap::load_or_create(dataset_dir.join(&entry.bitmap_file), rows.len())?;
            if bitmap.is_complete() {
                if idempotent {
                    info!("Enrichment {} already complete; no-op", output_path);
                    return Ok(MapResult {
                        output_path: output_path.clone(),
                        num_processed: 0,
                        num_errors: 0,
                        values: Vec::new(),
                    });
                }
                return Err(PipelineError::OutputColumnExists {
                    path: output_path.to_string(),
                }
                .into());
            }
            if options.resumable {
                known_field = Some(entry.output_field.clone());
                entry_committed = true;
                info!(
                    "Resuming enrichment {} ({} of {} rows done)",
                    output_path,
                    bitmap.count_ones(),
                    rows.len()
                );
            } else {
                delete_enrichment_files(&manifest, &output_path, &shard_dir).await?;
            }
        } else {
            return Err(PipelineError::OutputColumnExists {
                path: output_path.to_string(),
            }
            .into());
        }
    } else if shard_dir.exists() {
        // Crash before the first manifest commit: nothing is visible, the
        // partial shard is reclaimed.
        std::fs::remove_dir_all(&shard_dir)?;
    }

    std::fs::create_dir_all(&shard_dir)?;
    let mut bitmap =
        CompletedBitmap::load_or_create(dataset_dir.join(&bitmap_rel), rows.len())?;

    let flattened = source_path.has_wildcard();
    let input_type = match &computer {
        Computer::Signal(signal) => Some(signal.input_type()),
        Computer::Map(_) => None,
    };

    // Batch the flat item stream of rows that still need processing.
    let batch_size = if options.batch_size < 0 {
        usize::MAX
    } else {
        (options.batch_size.max(1)) as usize
    };
    let mut batches: Vec<Batch> = Vec::new();
    let mut current = Batch {
        slots: Vec::new(),
        inputs: Vec::new(),
        row_ids: Vec::new(),
    };
    for (row_pos, row) in rows.iter().enumerate() {
        if !row.targeted || bitmap.is_set(row_pos) {
            continue;
        }
        for (item_pos, (_, value)) in row.items.iter().enumerate() {
            current.slots.push((row_pos, item_pos));
            current.inputs.push(value.clone());
            if !current.row_ids.contains(&row.row_id) {
                current.row_ids.push(row.row_id.clone());
            }
            if current.inputs.len() >= batch_size {
                batches.push(std::mem::replace(
                    &mut current,
                    Batch {
                        slots: Vec::new(),
                        inputs: Vec::new(),
                        row_ids: Vec::new(),
                    },
                ));
            }
        }
    }
    if !current.inputs.is_empty() {
        batches.push(current);
    }

    let computer = Arc::new(computer);
    let cancel = options.cancel.clone();
    let num_jobs = options.num_jobs.max(1);

    let mut outcome_stream = futures::stream::iter(batches.into_iter())
        .map(|batch| {
            let computer = computer.clone();
            let cancel = cancel.clone();
            async move {
                if cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                    return (batch.slots, BatchOutcome::Cancelled);
                }
                let outcome = compute_batch(&computer, &batch, input_type).await;
                (batch.slots, outcome)
            }
        })
        .buffered(num_jobs);

    let meta = FlushMeta {
        dataset_dir: dataset_dir.clone(),
        manifest: manifest.clone(),
        descriptor: descriptor.clone(),
        source_path: source_path.clone(),
        output_path: output_path.clone(),
    };

    // Reassemble in source order and flush.
    let mut pending: VecDeque<(usize, usize, ItemResult)> = VecDeque::new();
    let mut stream_done = false;
    let mut cancelled = false;
    let mut infra_error: Option<SiftError> = None;

    let mut buffer: Vec<ShardRow> = Vec::new();
    let mut buffered_rows: Vec<usize> = Vec::new();
    let mut new_errors: Vec<RowError> = Vec::new();
    let mut writer: Option<ShardWriter> = None;

    let mut num_processed = 0usize;
    let mut num_errors = 0usize;
    let mut out_values: Vec<Value> = Vec::new();

    'rows: for (row_pos, row) in rows.iter().enumerate() {
        if bitmap.is_set(row_pos) {
            continue;
        }
        if !row.targeted {
            buffer.push(ShardRow::single(row.row_id.clone(), Vec::new(), Value::Null));
            buffered_rows.push(row_pos);
        } else {
            // Collect this row's item results from the ordered stream.
            let mut results: Vec<ItemResult> = Vec::with_capacity(row.items.len());
            while results.len() < row.items.len() {
                if let Some((r, _i, result)) = pending.pop_front() {
                    debug_assert_eq!(r, row_pos, "results arrive in source order");
                    results.push(result);
                    continue;
                }
                if stream_done || cancelled || infra_error.is_some() {
                    break 'rows;
                }
                match outcome_stream.next().await {
                    None => stream_done = true,
                    Some((_, BatchOutcome::Cancelled)) => {
                        cancelled = true;
                    }
                    Some((_, BatchOutcome::Crash(row_ids))) => {
                        infra_error =
                            Some(PipelineError::WorkerCrash { row_ids }.into());
                    }
                    Some((_, BatchOutcome::LengthMismatch { expected, actual })) => {
                        infra_error = Some(
                            PipelineError::InputExhausted {
                                processed: actual,
                                expected,
                            }
                            .into(),
                        );
                    }
                    Some((slots, BatchOutcome::Done(results_batch))) => {
                        for ((r, i), result) in slots.into_iter().zip(results_batch) {
                            pending.push_back((r, i, result));
                        }
                    }
                }
            }
            if results.len() < row.items.len() {
                break 'rows;
            }

            // Assemble the row's output and shard rows.
            let mut row_errored = false;
            let mut elements: Vec<(Vec<u32>, Value)> = Vec::with_capacity(results.len());
            for ((index, _), result) in row.items.iter().zip(results) {
                let value = match result {
                    ItemResult::Value(v) => v.unwrap_or(Value::Null),
                    ItemResult::Error(message) => {
                        if !row_errored {
                            row_errored = true;
                            new_errors.push(RowError {
                                row_id: row.row_id.clone(),
                                message,
                            });
                        }
                        Value::Null
                    }
                };
                elements.push((index.clone(), value));
            }
            if row_errored {
                num_errors += 1;
                if let Some(max_errors) = options.max_errors {
                    if num_errors > max_errors {
                        infra_error = Some(
                            PipelineError::RowErrorThresholdExceeded {
                                errors: num_errors,
                                max_errors,
                            }
                            .into(),
                        );
                        break 'rows;
                    }
                }
            }

            if flattened {
                let assembled = assemble_from_elements(elements.clone());
                if elements.is_empty() {
                    buffer.push(ShardRow::single(
                        row.row_id.clone(),
                        Vec::new(),
                        Value::List(Vec::new()),
                    ));
                } else {
                    for (index, value) in &elements {
                        buffer.push(ShardRow::single(row.row_id.clone(), index.clone(), value.clone()));
                    }
                }
                out_values.push(assembled);
            } else {
                let value = elements
                    .into_iter()
                    .next()
                    .map(|(_, v)| v)
                    .unwrap_or(Value::Null);
                buffer.push(ShardRow::single(row.row_id.clone(), Vec::new(), value.clone()));
                out_values.push(value);
            }
            num_processed += 1;
        }
        buffered_rows.push(row_pos);

        if buffered_rows.len() >= FLUSH_ROWS {
            flush(
                &meta,
                &shard_dir,
                &shard_dir_rel,
                &bitmap_rel,
                &errors_rel,
                &mut known_field,
                &mut writer,
                &mut bitmap,
                &mut buffer,
                &mut buffered_rows,
                &mut new_errors,
                &mut entry_committed,
                false,
            )
            .await?;
        }
    }

    flush(
        &meta,
        &shard_dir,
        &shard_dir_rel,
        &bitmap_rel,
        &errors_rel,
        &mut known_field,
        &mut writer,
        &mut bitmap,
        &mut buffer,
        &mut buffered_rows,
        &mut new_errors,
        &mut entry_committed,
        true,
    )
    .await?;

    if let Some(error) = infra_error {
        return Err(error);
    }
    if cancelled {
        return Err(PipelineError::Cancelled.into());
    }

    info!(
        "Enrichment {} wrote {} rows ({} errors)",
        output_path, num_processed, num_errors
    );
    Ok(MapResult {
        output_path: output_path.clone(),
        num_processed,
        num_errors,
        values: out_values,
    })
}

async fn compute_batch(
    computer: &Computer,
    batch: &Batch,
    input_type: Option<SignalInputType>,
) -> BatchOutcome {
    // Null inputs skip computation; only the rest reach the function.
    let mut live_positions: Vec<usize> = Vec::new();
    for (pos, input) in batch.inputs.iter().enumerate() {
        if !input.is_null() {
            live_positions.push(pos);
        }
    }

    let mut results: Vec<ItemResult> = batch
        .inputs
        .iter()
        .map(|_| ItemResult::Value(None))
        .collect();

    if live_positions.is_empty() {
        return BatchOutcome::Done(results);
    }

    let expected = live_positions.len();
    let computed: Result<Result<Vec<Option<Value>>, SiftError>, tokio::task::JoinError> =
        match computer {
            Computer::Map(map_fn) => {
                let map_fn = map_fn.clone();
                let inputs: Vec<Value> = live_positions
                    .iter()
                    .map(|pos| batch.inputs[*pos].clone())
                    .collect();
                tokio::task::spawn_blocking(move || map_fn(&inputs)).await
            }
            Computer::Signal(signal) => {
                let signal = signal.clone();
                let input_type = input_type.unwrap_or(SignalInputType::Text);
                let mut inputs: Vec<SignalInput> = Vec::with_capacity(live_positions.len());
                let mut conversion_errors: Vec<(usize, String)> = Vec::new();
                let mut kept: Vec<usize> = Vec::new();
                for pos in &live_positions {
                    match to_signal_input(&batch.inputs[*pos], input_type) {
                        Ok(input) => {
                            inputs.push(input);
                            kept.push(*pos);
                        }
                        Err(e) => conversion_errors.push((*pos, e.to_string())),
                    }
                }
                for (pos, message) in conversion_errors {
                    results[pos] = ItemResult::Error(message);
                }
                if inputs.is_empty() {
                    return BatchOutcome::Done(results);
                }
                live_positions = kept;
                tokio::spawn(async move { signal.compute(&inputs).await }).await
            }
        };

    match computed {
        Err(_join_error) => BatchOutcome::Crash(batch.row_ids.clone()),
        Ok(Err(e)) => {
            let message = e.to_string();
            for pos in &live_positions {
                results[*pos] = ItemResult::Error(message.clone());
            }
            BatchOutcome::Done(results)
        }
        Ok(Ok(outputs)) => {
            if outputs.len() != live_positions.len() {
                return BatchOutcome::LengthMismatch {
                    expected: expected.max(live_positions.len()),
                    actual: outputs.len(),
                };
            }
            for (pos, output) in live_positions.iter().zip(outputs) {
                results[*pos] = ItemResult::Value(output);
            }
            BatchOutcome::Done(results)
        }
    }
}

fn to_signal_input(value: &Value, input_type: SignalInputType) -> Result<SignalInput, SiftError> {
    match input_type {
        SignalInputType::Text => match value {
            Value::Scalar(Scalar::String(s)) => Ok(SignalInput::Text(s.clone())),
            other => Err(SiftError::Validation(format!(
                "signal expects string input, got {other:?}"
            ))),
        },
        SignalInputType::TextEmbedding => match value {
            Value::List(chunks) => {
                let mut out = Vec::with_capacity(chunks.len());
                for chunk in chunks {
                    let Value::Struct(map) = chunk else {
                        return Err(SiftError::Validation(
                            "embedding column chunks must be structs".to_string(),
                        ));
                    };
                    let Some(Value::Span { start, end }) = map.get("span") else {
                        return Err(SiftError::Validation(
                            "embedding chunk missing span".to_string(),
                        ));
                    };
                    let Some(Value::Scalar(Scalar::Embedding(vector))) = map.get("embedding")
                    else {
                        return Err(SiftError::Validation(
                            "embedding chunk missing vector".to_string(),
                        ));
                    };
                    out.push(ChunkVector {
                        start: *start,
                        end: *end,
                        vector: vector.clone(),
                    });
                }
                Ok(SignalInput::TextEmbedding(out))
            }
            other => Err(SiftError::Validation(format!(
                "signal expects an embedding column, got {other:?}"
            ))),
        },
    }
}

/// Infer the output field of a map from its first non-null value.
pub(crate) fn infer_output_field(value: &Value) -> Field {
    match value {
        Value::Null => Field::string(),
        Value::Span { .. } => Field::span(),
        Value::Scalar(scalar) => Field::of(match scalar {
            Scalar::String(_) => DType::String,
            Scalar::Bool(_) => DType::Boolean,
            Scalar::Binary(_) => DType::Binary,
            Scalar::Int(_) => DType::Int64,
            Scalar::UInt(_) => DType::UInt64,
            Scalar::Float(_) => DType::Float64,
            Scalar::Date(_) => DType::Date,
            Scalar::Time(_) => DType::Time,
            Scalar::Timestamp(_) => DType::Timestamp,
            Scalar::Interval(_) => DType::Interval,
            Scalar::Embedding(_) => DType::Embedding,
        }),
        Value::List(items) => Field::repeated(
            items
                .iter()
                .find(|v| !v.is_null())
                .map(infer_output_field)
                .unwrap_or_else(Field::string),
        ),
        Value::Struct(map) => Field::struct_of(
            map.iter()
                .map(|(name, child)| (name.clone(), infer_output_field(child))),
        ),
    }
}

/// Flush-time context, cloned out of the job so the computer can move
/// into the worker stream independently.
struct FlushMeta {
    dataset_dir: PathBuf,
    manifest: Arc<ManifestStore>,
    descriptor: SignalDescriptor,
    source_path: Path,
    output_path: Path,
}

async fn delete_enrichment_files(
    manifest: &Arc<ManifestStore>,
    output_path: &Path,
    shard_dir: &std::path::Path,
) -> Result<(), SiftError> {
    if shard_dir.exists() {
        std::fs::remove_dir_all(shard_dir)?;
    }
    let output_path = output_path.clone();
    manifest
        .update(move |m| m.enrichments.retain(|e| e.output_path != output_path))
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn flush(
    meta: &FlushMeta,
    shard_dir: &std::path::Path,
    shard_dir_rel: &str,
    bitmap_rel: &str,
    errors_rel: &str,
    known_field: &mut Option<Field>,
    writer: &mut Option<ShardWriter>,
    bitmap: &mut CompletedBitmap,
    buffer: &mut Vec<ShardRow>,
    buffered_rows: &mut Vec<usize>,
    new_errors: &mut Vec<RowError>,
    entry_committed: &mut bool,
    finishing: bool,
) -> Result<(), SiftError> {
    if buffered_rows.is_empty() {
        return Ok(());
    }

    // Maps infer their output schema from the first non-null output. An
    // all-null prefix stays buffered until a typed value arrives; a map
    // that never produces one records a fully-null string column with the
    // expected row count.
    if known_field.is_none() {
        let inferred = buffer
            .iter()
            .map(|r| r.value())
            .find(|v| !v.is_null())
            .map(infer_output_field);
        match inferred {
            Some(field) => *known_field = Some(field),
            None if finishing => *known_field = Some(Field::string()),
            None => return Ok(()),
        }
    }
    let field = known_field.clone().expect("field known past this point");

    if writer.is_none() {
        *writer = Some(ShardWriter::open(shard_dir, single_column(field.clone()))?);
    }
    let writer = writer.as_mut().expect("writer opened above");

    // Durability order: shard part, then bitmap, then manifest.
    writer.write_part(buffer)?;
    for row_pos in buffered_rows.iter() {
        bitmap.set(*row_pos);
    }
    bitmap.save()?;

    if !new_errors.is_empty() {
        let errors_path = meta.dataset_dir.join(errors_rel);
        let mut all: Vec<RowError> = if errors_path.exists() {
            read_json(&errors_path)?
        } else {
            Vec::new()
        };
        all.append(new_errors);
        atomic_write_json(&errors_path, &all)?;
    }

    let num_items = bitmap.count_ones();
    let entry = EnrichmentEntry {
        output_path: meta.output_path.clone(),
        source_path: meta.source_path.clone(),
        signal: meta.descriptor.clone(),
        output_field: field,
        shard_dir: shard_dir_rel.to_string(),
        bitmap_file: bitmap_rel.to_string(),
        errors_file: errors_rel.to_string(),
        num_items,
        created_at: Utc::now(),
    };
    let committed = *entry_committed;
    meta.manifest
        .update(move |m| {
            if committed {
                if let Some(existing) = m
                    .enrichments
                    .iter_mut()
                    .find(|e| e.output_path == entry.output_path)
                {
                    existing.num_items = num_items;
                    existing.output_field = entry.output_field.clone();
                    return;
                }
            }
            m.enrichments.retain(|e| e.output_path != entry.output_path);
            m.enrichments.push(entry);
        })
        .await?;
    *entry_committed = true;

    buffer.clear();
    buffered_rows.clear();
    Ok(())
}
