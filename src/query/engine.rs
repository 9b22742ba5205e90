//! Planning and execution of `select_rows`.
//!
//! Planning resolves every projected path against the merged
//! manifest-snapshot schema, rewrites UDF columns into inline signal
//! invocations, rewrites searches into span-producing computations with a
//! sort score, and type-checks filters. Execution filters, computes,
//! sorts through a bounded top-K heap, and shapes rows as JSON.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;

use crate::dataset::labels::LabelStore;
use crate::dataset::manifest::Manifest;
use crate::error::{QueryError, SiftError};
use crate::query::options::{
    BinaryOp, Column, Filter, ListOp, Search, SelectRowsOptions, SelectRowsSchema, SelectedRow,
    SortOrder, UnaryOp,
};
use crate::schema::value::compare_values;
use crate::schema::{DType, Field, Path, PathSegment, Scalar, Schema, Value, ROW_ID};
use crate::signals::{
    ChunkVector, Signal, SignalDescriptor, SignalInput, SignalInputType, SignalRegistry,
};
use crate::utils::math::cosine_similarity;

/// Reserved top-level path labels project under.
pub const LABELS_PATH: &str = "__labels__";

const UDF_BATCH: usize = 256;

/// A fully loaded row: source value plus assembled enrichment values.
#[derive(Debug, Clone)]
pub struct MergedRow {
    pub row_id: String,
    pub source: Value,
    pub enrichments: BTreeMap<Path, Value>,
}

impl MergedRow {
    /// All concrete values matching `path`, enrichment paths included.
    pub fn resolve_values(&self, path: &Path) -> Vec<Value> {
        if path.segments() == [PathSegment::Name(ROW_ID.to_string())] {
            return vec![Value::string(self.row_id.clone())];
        }
        // Longest enrichment output path that prefixes the query path wins.
        let mut best: Option<(&Path, &Value)> = None;
        for (output_path, value) in &self.enrichments {
            if path.includes(output_path)
                && best.map(|(p, _)| output_path.len() > p.len()).unwrap_or(true)
            {
                best = Some((output_path, value));
            }
        }
        if let Some((output_path, value)) = best {
            let remainder = Path::new(path.segments()[output_path.len()..].to_vec());
            return value
                .resolve(&remainder)
                .into_iter()
                .map(|(_, v)| v.clone())
                .collect();
        }
        self.source
            .resolve(path)
            .into_iter()
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// The single value at `path` (first match), null when absent.
    pub fn value_at(&self, path: &Path) -> Value {
        self.resolve_values(path).into_iter().next().unwrap_or(Value::Null)
    }

    fn attach(&mut self, path: Path, value: Value) {
        self.enrichments.insert(path, value);
    }
}

/// Everything `select_rows` needs besides the rows themselves.
pub(crate) struct QueryContext<'a> {
    pub merged_schema: Schema,
    pub manifest: Arc<Manifest>,
    pub labels: &'a LabelStore,
    pub signals: &'a SignalRegistry,
}

struct UdfPlan {
    input_path: Path,
    signal: Arc<dyn Signal>,
    alias: Path,
    best_effort: bool,
    /// Contributes a descending sort score from max chunk score per row.
    scored: bool,
}

struct SemanticPlan {
    embedding_path: Path,
    alias: Path,
    query_vector: Vec<f32>,
}

pub(crate) struct CompiledFilter {
    filter: Filter,
    regex: Option<Regex>,
    /// Typed comparison values for binary/list filters.
    values: Vec<Value>,
}

/// Resolve the output schema of a query, including UDF and search columns.
pub(crate) async fn select_rows_schema(
    ctx: &QueryContext<'_>,
    options: &SelectRowsOptions,
) -> Result<SelectRowsSchema, SiftError> {
    let plan = plan(ctx, options).await?;
    let mut data_schema = ctx.merged_schema.clone();
    let mut computed_paths = Vec::new();
    for udf in &plan.udfs {
        attach_computed(&mut data_schema, &udf.alias, udf.signal.output_schema())?;
        computed_paths.push(udf.alias.clone());
    }
    for semantic in &plan.semantic {
        let field = Field::repeated(Field::struct_of([
            ("span", Field::span()),
            ("score", Field::of(DType::Float32)),
        ]));
        attach_computed(&mut data_schema, &semantic.alias, field)?;
        computed_paths.push(semantic.alias.clone());
    }
    Ok(SelectRowsSchema {
        data_schema,
        computed_paths,
    })
}

fn attach_computed(schema: &mut Schema, alias: &Path, field: Field) -> Result<(), SiftError> {
    let Some(parent) = alias.parent() else {
        return Ok(());
    };
    let Some(PathSegment::Name(name)) = alias.last() else {
        return Ok(());
    };
    if parent.is_empty() {
        schema.fields.insert(name.clone(), field);
        return Ok(());
    }
    schema.attach(&parent, name, field)?;
    Ok(())
}

struct Plan {
    projected: Vec<Path>,
    udfs: Vec<UdfPlan>,
    semantic: Vec<SemanticPlan>,
    filters: Vec<CompiledFilter>,
    sort_by: Vec<Path>,
    sort_order: SortOrder,
    /// Sort on search scores when no explicit sort was given.
    score_sort: bool,
}

async fn plan(ctx: &QueryContext<'_>, options: &SelectRowsOptions) -> Result<Plan, SiftError> {
    let mut projected: Vec<Path> = Vec::new();
    let mut udfs: Vec<UdfPlan> = Vec::new();
    let mut semantic: Vec<SemanticPlan> = Vec::new();

    match &options.columns {
        None => {
            projected.extend(ctx.merged_schema.fields.keys().map(|n| Path::field(n.clone())));
        }
        Some(columns) => {
            for column in columns {
                match column {
                    Column::Path(path) => {
                        if path.first() != Some(&PathSegment::Name(LABELS_PATH.to_string()))
                            && path.segments() != [PathSegment::Name(ROW_ID.to_string())]
                        {
                            ctx.merged_schema.get_field(path)?;
                        }
                        projected.push(path.clone());
                    }
                    Column::Udf {
                        path,
                        signal,
                        alias,
                        best_effort,
                    } => {
                        let resolved = ctx.signals.resolve(signal)?;
                        validate_signal_input(&ctx.merged_schema, path, resolved.as_ref())?;
                        udfs.push(UdfPlan {
                            input_path: path.clone(),
                            signal: resolved,
                            alias: alias.as_str().into(),
                            best_effort: *best_effort,
                            scored: false,
                        });
                    }
                }
            }
        }
    }

    // Rewrite searches into span-producing computations plus sort scores.
    for search in &options.searches {
        match search {
            Search::Keyword { path, query } => {
                let descriptor = SignalDescriptor::new(
                    crate::signals::substring::NAME,
                    serde_json::json!({ "query": query }),
                );
                let signal = ctx.signals.resolve(&descriptor)?;
                validate_signal_input(&ctx.merged_schema, path, signal.as_ref())?;
                udfs.push(UdfPlan {
                    input_path: path.clone(),
                    signal,
                    alias: path.child_name(format!("keyword({query})")),
                    best_effort: false,
                    scored: true,
                });
            }
            Search::Semantic {
                path,
                query,
                embedding,
            } => {
                let embedding_path = path.child_name(embedding.clone());
                require_embedding_column(ctx, path, &embedding_path, embedding)?;
                let embedder = ctx.signals.embeddings().get(embedding)?;
                let mut vectors = embedder.embed_batch(&[query.clone()]).await?;
                semantic.push(SemanticPlan {
                    embedding_path,
                    alias: path.child_name(format!("semantic({embedding})")),
                    query_vector: vectors.pop().ok_or_else(|| {
                        SiftError::Validation("embedder returned no query vector".to_string())
                    })?,
                });
            }
            Search::Concept {
                path,
                namespace,
                concept_name,
                embedding,
            } => {
                let embedding_path = path.child_name(embedding.clone());
                require_embedding_column(ctx, path, &embedding_path, embedding)?;
                let descriptor = SignalDescriptor::new(
                    crate::signals::embedding_signal::CONCEPT_SCORE_NAME,
                    serde_json::json!({
                        "namespace": namespace,
                        "concept_name": concept_name,
                        "embedding": embedding,
                    }),
                );
                let signal = ctx.signals.resolve(&descriptor)?;
                udfs.push(UdfPlan {
                    input_path: embedding_path,
                    signal,
                    alias: path.child_name(format!("{namespace}/{concept_name}/{embedding}")),
                    best_effort: false,
                    scored: true,
                });
            }
        }
    }

    // Filters type-check at plan time where the dtype is known.
    let mut filters = Vec::new();
    for filter in &options.filters {
        filters.push(compile_filter(&ctx.merged_schema, filter)?);
    }
    for path in &options.sort_by {
        let is_computed = udfs.iter().any(|u| path.includes(&u.alias))
            || semantic.iter().any(|s| path.includes(&s.alias));
        if !is_computed {
            ctx.merged_schema.get_field(path)?;
        }
    }

    let score_sort =
        options.sort_by.is_empty()
            && (semantic.len() + udfs.iter().filter(|u| u.scored).count()) > 0;

    Ok(Plan {
        projected,
        udfs,
        semantic,
        filters,
        sort_by: options.sort_by.clone(),
        sort_order: options.sort_order,
        score_sort,
    })
}

fn require_embedding_column(
    ctx: &QueryContext<'_>,
    path: &Path,
    embedding_path: &Path,
    embedding: &str,
) -> Result<(), SiftError> {
    if ctx.manifest.find_enrichment(embedding_path).is_none() {
        return Err(QueryError::UnsupportedSearchForPath {
            path: path.to_string(),
            message: format!(
                "no materialized embedding '{embedding}'; run compute_embedding first"
            ),
        }
        .into());
    }
    Ok(())
}

fn validate_signal_input(
    schema: &Schema,
    path: &Path,
    signal: &dyn Signal,
) -> Result<(), SiftError> {
    let field = schema.get_field(path)?;
    match signal.input_type() {
        SignalInputType::Text => {
            let Some(dtype) = field.dtype else {
                return Err(QueryError::TypeMismatch {
                    path: path.to_string(),
                    message: "signal input must be a scalar text field".to_string(),
                }
                .into());
            };
            if !signal.accepts(dtype) {
                return Err(QueryError::TypeMismatch {
                    path: path.to_string(),
                    message: format!("signal '{}' rejects dtype {dtype}", signal.descriptor().name),
                }
                .into());
            }
        }
        SignalInputType::TextEmbedding => {
            let ok = field
                .repeated_field
                .as_ref()
                .and_then(|e| e.fields.as_ref())
                .is_some_and(|m| {
                    m.values().any(|f| f.dtype == Some(DType::Embedding))
                });
            if !ok {
                return Err(QueryError::TypeMismatch {
                    path: path.to_string(),
                    message: "signal input must be an embedding column".to_string(),
                }
                .into());
            }
        }
    }
    Ok(())
}

pub(crate) fn compile_filter(
    schema: &Schema,
    filter: &Filter,
) -> Result<CompiledFilter, SiftError> {
    let path = filter.path();
    let field = if path.first() == Some(&PathSegment::Name(LABELS_PATH.to_string())) {
        None
    } else {
        Some(schema.get_field(path)?)
    };
    let dtype = field.and_then(|f| f.dtype);

    let mut regex = None;
    let mut values = Vec::new();
    match filter {
        Filter::Unary { .. } => {}
        Filter::Binary { op, value, .. } => match op {
            BinaryOp::RegexMatches => {
                if dtype.is_some() && dtype != Some(DType::String) {
                    return Err(type_mismatch(path, "regex_matches requires a string field"));
                }
                let pattern = value.as_str().ok_or_else(|| {
                    type_mismatch(path, "regex_matches requires a string pattern")
                })?;
                regex = Some(Regex::new(pattern).map_err(|e| {
                    SiftError::Validation(format!("invalid regex pattern: {e}"))
                })?);
            }
            BinaryOp::LengthGreater | BinaryOp::LengthLess => {
                let ok = dtype.map(|d| d == DType::String).unwrap_or(false)
                    || field.is_some_and(|f| f.repeated_field.is_some());
                if !ok {
                    return Err(type_mismatch(path, "length ops require a string or list"));
                }
                values.push(Value::Scalar(Scalar::UInt(value.as_u64().ok_or_else(
                    || type_mismatch(path, "length ops require an unsigned length"),
                )?)));
            }
            op => {
                if op.is_ordering() {
                    if let Some(d) = dtype {
                        if !d.is_comparable() {
                            return Err(type_mismatch(path, "dtype does not support ordering"));
                        }
                    }
                }
                values.push(filter_value(dtype, value, path)?);
            }
        },
        Filter::List { op: ListOp::In, values: raw, .. } => {
            for value in raw {
                values.push(filter_value(dtype, value, path)?);
            }
        }
    }
    Ok(CompiledFilter {
        filter: filter.clone(),
        regex,
        values,
    })
}

fn type_mismatch(path: &Path, message: &str) -> SiftError {
    QueryError::TypeMismatch {
        path: path.to_string(),
        message: message.to_string(),
    }
    .into()
}

/// Convert a JSON filter operand to a typed value, guided by the field
/// dtype when known.
fn filter_value(
    dtype: Option<DType>,
    raw: &serde_json::Value,
    path: &Path,
) -> Result<Value, SiftError> {
    if let Some(dtype) = dtype {
        return Value::from_json(&Field::of(dtype), raw)
            .map_err(|e| type_mismatch(path, &e.to_string()));
    }
    // Untyped (label or struct) comparisons fall back on JSON shape.
    Ok(match raw {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::int(i)
            } else {
                Value::float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::string(s.clone()),
        other => Value::string(other.to_string()),
    })
}

pub(crate) fn eval_filter(
    row: &MergedRow,
    labels: &LabelStore,
    compiled: &CompiledFilter,
) -> bool {
    let path = compiled.filter.path();

    // Label paths evaluate against the label store.
    if path.first() == Some(&PathSegment::Name(LABELS_PATH.to_string())) {
        if let Some(PathSegment::Name(label)) = path.segments().get(1) {
            let present = labels.has_label(&row.row_id, label);
            return match &compiled.filter {
                Filter::Unary { op: UnaryOp::Exists, .. } => present,
                Filter::Unary { op: UnaryOp::NotExists, .. } => !present,
                _ => present,
            };
        }
    }

    let resolved = row.resolve_values(path);
    let non_null: Vec<&Value> = resolved.iter().filter(|v| !v.is_null()).collect();

    match &compiled.filter {
        Filter::Unary { op, .. } => match op {
            UnaryOp::Exists => !non_null.is_empty(),
            UnaryOp::NotExists => non_null.is_empty(),
        },
        Filter::List { .. } => non_null
            .iter()
            .any(|v| compiled.values.iter().any(|want| want == *v)),
        Filter::Binary { op, .. } => match op {
            BinaryOp::RegexMatches => {
                let Some(regex) = &compiled.regex else {
                    return false;
                };
                non_null
                    .iter()
                    .any(|v| v.as_str().map(|s| regex.is_match(s)).unwrap_or(false))
            }
            BinaryOp::LengthGreater | BinaryOp::LengthLess => {
                let Some(Value::Scalar(Scalar::UInt(want))) = compiled.values.first() else {
                    return false;
                };
                non_null.iter().any(|v| match v.length() {
                    Some(len) => match op {
                        BinaryOp::LengthGreater => len as u64 > *want,
                        _ => (len as u64) < *want,
                    },
                    None => false,
                })
            }
            op => {
                let Some(want) = compiled.values.first() else {
                    return false;
                };
                non_null.iter().any(|v| {
                    let ord = compare_values(v, want);
                    match op {
                        BinaryOp::Equals => ord == Ordering::Equal,
                        BinaryOp::NotEqual => ord != Ordering::Equal,
                        BinaryOp::Less => ord == Ordering::Less,
                        BinaryOp::LessEqual => ord != Ordering::Greater,
                        BinaryOp::Greater => ord == Ordering::Greater,
                        BinaryOp::GreaterEqual => ord != Ordering::Less,
                        _ => false,
                    }
                })
            }
        },
    }
}

/// Sort key with embedded direction flags; total order, nulls last in
/// either direction, row-id ascending as the final tiebreak.
#[derive(Debug, Clone)]
struct RowKey {
    keys: Vec<(Value, bool)>,
    row_id: String,
}

impl PartialEq for RowKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for RowKey {}
impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((a, desc), (b, _)) in self.keys.iter().zip(other.keys.iter()) {
            let ord = match (a.is_null(), b.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    let ord = compare_values(a, b);
                    if *desc {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.row_id.cmp(&other.row_id)
    }
}

struct HeapEntry {
    key: RowKey,
    row_index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Execute a query over loaded rows, returning shaped rows in
/// `(sort, row_id)` order.
pub(crate) async fn select_rows(
    ctx: &QueryContext<'_>,
    mut rows: Vec<MergedRow>,
    options: &SelectRowsOptions,
) -> Result<Vec<SelectedRow>, SiftError> {
    let plan = plan(ctx, options).await?;

    // Label include/exclude first, then filters.
    rows.retain(|row| {
        (plan_labels_pass(ctx.labels, row, &options.include_labels, &options.exclude_labels))
            && plan.filters.iter().all(|f| eval_filter(row, ctx.labels, f))
    });

    // Inline UDF columns and searches run over the surviving rows.
    for udf in &plan.udfs {
        run_udf(udf, &mut rows).await?;
    }
    for semantic in &plan.semantic {
        run_semantic(semantic, &mut rows);
    }

    // Sort keys: explicit paths, else search scores (descending).
    let sorted_indices: Vec<usize> = if !plan.sort_by.is_empty() || plan.score_sort {
        let desc = if plan.score_sort {
            true
        } else {
            plan.sort_order == SortOrder::Desc
        };
        let key_paths: Vec<Path> = if plan.score_sort {
            plan.udfs
                .iter()
                .filter(|u| u.scored)
                .map(|u| u.alias.child(PathSegment::Wildcard).child_name("score"))
                .chain(
                    plan.semantic
                        .iter()
                        .map(|s| s.alias.child(PathSegment::Wildcard).child_name("score")),
                )
                .collect()
        } else {
            plan.sort_by.clone()
        };

        let keys: Vec<RowKey> = rows
            .iter()
            .map(|row| {
                let keys = key_paths
                    .iter()
                    .map(|path| {
                        let candidates: Vec<Value> = if plan.score_sort
                            && path.last() == Some(&PathSegment::Name("score".to_string()))
                            && path.segments().len() >= 2
                        {
                            // Keyword searches have spans, not scores: fall
                            // back to match count.
                            let values = row.resolve_values(path);
                            if values.is_empty() {
                                let parent =
                                    Path::new(path.segments()[..path.len() - 2].to_vec());
                                match row.value_at(&parent) {
                                    Value::List(items) => {
                                        vec![Value::float(items.len() as f64)]
                                    }
                                    _ => vec![],
                                }
                            } else {
                                values
                            }
                        } else {
                            row.resolve_values(path)
                        };
                        let best = candidates
                            .into_iter()
                            .filter(|v| !v.is_null())
                            .reduce(|a, b| {
                                let keep_b = if desc {
                                    compare_values(&b, &a) == Ordering::Greater
                                } else {
                                    compare_values(&b, &a) == Ordering::Less
                                };
                                if keep_b {
                                    b
                                } else {
                                    a
                                }
                            });
                        (best.unwrap_or(Value::Null), desc)
                    })
                    .collect();
                RowKey {
                    keys,
                    row_id: row.row_id.clone(),
                }
            })
            .collect();

        match options.limit {
            Some(limit) => {
                // Bounded top-K on (sort tuple, row_id).
                let k = limit + options.offset;
                let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(k + 1);
                for (row_index, key) in keys.into_iter().enumerate() {
                    heap.push(HeapEntry {
                        key,
                        row_index,
                    });
                    if heap.len() > k {
                        heap.pop();
                    }
                }
                let mut entries = heap.into_vec();
                entries.sort();
                entries.into_iter().map(|e| e.row_index).collect()
            }
            None => {
                let mut indexed: Vec<(RowKey, usize)> =
                    keys.into_iter().enumerate().map(|(i, k)| (k, i)).collect();
                indexed.sort_by(|a, b| a.0.cmp(&b.0));
                indexed.into_iter().map(|(_, i)| i).collect()
            }
        }
    } else {
        (0..rows.len()).collect()
    };

    let page: Vec<usize> = sorted_indices
        .into_iter()
        .skip(options.offset)
        .take(options.limit.unwrap_or(usize::MAX))
        .collect();

    // Projection: plain columns plus every computed alias.
    let mut projected = plan.projected.clone();
    projected.extend(plan.udfs.iter().map(|u| u.alias.clone()));
    projected.extend(plan.semantic.iter().map(|s| s.alias.clone()));
    projected.sort();
    projected.dedup();

    let mut out = Vec::with_capacity(page.len());
    for row_index in page {
        let row = &rows[row_index];
        out.push(shape_row(ctx, row, &projected, options.combine_columns));
    }
    Ok(out)
}

fn plan_labels_pass(
    labels: &LabelStore,
    row: &MergedRow,
    include: &[String],
    exclude: &[String],
) -> bool {
    include
        .iter()
        .all(|label| labels.has_label(&row.row_id, label))
        && !exclude
            .iter()
            .any(|label| labels.has_label(&row.row_id, label))
}

async fn run_udf(udf: &UdfPlan, rows: &mut [MergedRow]) -> Result<(), SiftError> {
    for chunk_start in (0..rows.len()).step_by(UDF_BATCH) {
        let chunk_end = (chunk_start + UDF_BATCH).min(rows.len());
        let mut inputs: Vec<SignalInput> = Vec::new();
        let mut live: Vec<usize> = Vec::new();
        for (offset, row) in rows[chunk_start..chunk_end].iter().enumerate() {
            let value = row.value_at(&udf.input_path);
            match signal_input_from_value(&value, udf.signal.input_type()) {
                Some(input) => {
                    inputs.push(input);
                    live.push(chunk_start + offset);
                }
                None => continue,
            }
        }
        if inputs.is_empty() {
            continue;
        }
        match udf.signal.compute(&inputs).await {
            Ok(outputs) => {
                for (row_index, output) in live.into_iter().zip(outputs) {
                    rows[row_index].attach(udf.alias.clone(), output.unwrap_or(Value::Null));
                }
            }
            Err(e) if udf.best_effort => {
                tracing::warn!("best-effort UDF '{}' failed: {e}", udf.alias);
                for row_index in live {
                    rows[row_index].attach(udf.alias.clone(), Value::Null);
                }
            }
            Err(e) => {
                return Err(QueryError::Udf {
                    alias: udf.alias.to_string(),
                    source: Box::new(e),
                }
                .into());
            }
        }
    }
    Ok(())
}

fn signal_input_from_value(value: &Value, input_type: SignalInputType) -> Option<SignalInput> {
    match input_type {
        SignalInputType::Text => value.as_str().map(|s| SignalInput::Text(s.to_string())),
        SignalInputType::TextEmbedding => match value {
            Value::List(chunks) => {
                let mut out = Vec::with_capacity(chunks.len());
                for chunk in chunks {
                    let Value::Struct(map) = chunk else { return None };
                    let Some(Value::Span { start, end }) = map.get("span") else {
                        return None;
                    };
                    let Some(Value::Scalar(Scalar::Embedding(vector))) = map.get("embedding")
                    else {
                        return None;
                    };
                    out.push(ChunkVector {
                        start: *start,
                        end: *end,
                        vector: vector.clone(),
                    });
                }
                Some(SignalInput::TextEmbedding(out))
            }
            _ => None,
        },
    }
}

fn run_semantic(plan: &SemanticPlan, rows: &mut [MergedRow]) {
    for row in rows.iter_mut() {
        let chunks = row.value_at(&plan.embedding_path);
        let Value::List(chunks) = chunks else {
            row.attach(plan.alias.clone(), Value::Null);
            continue;
        };
        let scored: Vec<Value> = chunks
            .iter()
            .filter_map(|chunk| {
                let Value::Struct(map) = chunk else { return None };
                let Value::Span { start, end } = map.get("span")? else {
                    return None;
                };
                let vector = map.get("embedding")?.as_embedding()?;
                let score = cosine_similarity(&plan.query_vector, vector);
                Some(Value::Struct(BTreeMap::from([
                    ("span".to_string(), Value::span(*start, *end)),
                    ("score".to_string(), Value::float(score as f64)),
                ])))
            })
            .collect();
        row.attach(plan.alias.clone(), Value::List(scored));
    }
}

/// Shape one row as JSON, nested or flat.
fn shape_row(
    ctx: &QueryContext<'_>,
    row: &MergedRow,
    projected: &[Path],
    combine_columns: bool,
) -> SelectedRow {
    if !combine_columns {
        let mut flat = serde_json::Map::new();
        flat.insert(ROW_ID.to_string(), serde_json::json!(row.row_id));
        for path in projected {
            flat.insert(path.to_string(), projected_json(ctx, row, path));
        }
        return SelectedRow {
            row_id: row.row_id.clone(),
            value: serde_json::Value::Object(flat),
        };
    }

    let mut object = serde_json::Map::new();
    object.insert(ROW_ID.to_string(), serde_json::json!(row.row_id));
    for path in projected {
        let json = projected_json(ctx, row, path);
        insert_nested(&mut object, path.segments(), json);
    }
    SelectedRow {
        row_id: row.row_id.clone(),
        value: serde_json::Value::Object(object),
    }
}

fn projected_json(ctx: &QueryContext<'_>, row: &MergedRow, path: &Path) -> serde_json::Value {
    if path.first() == Some(&PathSegment::Name(LABELS_PATH.to_string())) {
        let labels = ctx.labels.labels_for(&row.row_id);
        match path.segments().get(1) {
            Some(PathSegment::Name(name)) => {
                return labels
                    .get(name)
                    .map(|r| serde_json::json!({ "label": r.label, "created": r.created }))
                    .unwrap_or(serde_json::Value::Null);
            }
            _ => {
                return serde_json::Value::Object(
                    labels
                        .into_iter()
                        .map(|(name, r)| {
                            (name, serde_json::json!({ "label": r.label, "created": r.created }))
                        })
                        .collect(),
                );
            }
        }
    }
    row.value_at(path).to_json()
}

/// Insert a value at a nested position. A scalar already present at an
/// intermediate position is wrapped as `{"__value__": scalar}` so derived
/// children can sit beside it.
fn insert_nested(
    object: &mut serde_json::Map<String, serde_json::Value>,
    segments: &[PathSegment],
    value: serde_json::Value,
) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let key = head.to_string();
    if rest.is_empty() {
        match object.get_mut(&key) {
            Some(serde_json::Value::Object(existing)) => {
                existing.insert("__value__".to_string(), value);
            }
            _ => {
                object.insert(key, value);
            }
        }
        return;
    }
    let entry = object
        .entry(key)
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    if !entry.is_object() {
        let old = entry.take();
        *entry = serde_json::json!({ "__value__": old });
    }
    let map = entry.as_object_mut().expect("coerced to object above");
    insert_nested(map, rest, value);
}
