//! Value-tree ⇄ arrow conversion for an arbitrary nested schema.
//!
//! Shards are parquet files of record batches; every batch carries the
//! reserved `__rowid__` and `__index__` columns plus one arrow column per
//! shard column. The mapping is recursive: struct fields become arrow
//! structs, repeated fields become lists, spans become `{start, end}`
//! structs, embeddings become float32 lists. `float16` is widened to
//! float32 on disk.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, DurationMicrosecondArray,
    Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, Int8Array, ListArray,
    RecordBatch, StringArray, StructArray, Time64MicrosecondArray, TimestampMicrosecondArray,
    UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow::buffer::{NullBuffer, OffsetBuffer, ScalarBuffer};
use arrow::datatypes::{
    DataType, Field as ArrowField, Fields, Schema as ArrowSchema, SchemaRef, TimeUnit,
};
use chrono::{DateTime, NaiveDate};

use crate::error::SiftError;
use crate::schema::value::time_to_micros;
use crate::schema::{DType, Field, Scalar, Value};

pub const ROW_ID_COLUMN: &str = "__rowid__";
pub const INDEX_COLUMN: &str = "__index__";
pub const VALUE_COLUMN: &str = "__value__";

/// One materialized shard row: the row id, the index path when the row is
/// a flattened element of a repeated input, and the column values keyed by
/// column name.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRow {
    pub row_id: String,
    pub index: Vec<u32>,
    pub values: BTreeMap<String, Value>,
}

impl ShardRow {
    pub fn new(row_id: impl Into<String>, values: BTreeMap<String, Value>) -> Self {
        Self {
            row_id: row_id.into(),
            index: Vec::new(),
            values,
        }
    }

    /// Row for a single-column enrichment shard.
    pub fn single(row_id: impl Into<String>, index: Vec<u32>, value: Value) -> Self {
        Self {
            row_id: row_id.into(),
            index,
            values: BTreeMap::from([(VALUE_COLUMN.to_string(), value)]),
        }
    }

    /// The single enrichment column value.
    pub fn value(&self) -> &Value {
        self.values.get(VALUE_COLUMN).unwrap_or(&Value::Null)
    }
}

/// Arrow schema of a shard with the given columns.
pub fn shard_arrow_schema(columns: &[(String, Field)]) -> SchemaRef {
    let mut fields = vec![
        ArrowField::new(ROW_ID_COLUMN, DataType::Utf8, false),
        ArrowField::new(
            INDEX_COLUMN,
            DataType::List(Arc::new(ArrowField::new("item", DataType::UInt32, true))),
            true,
        ),
    ];
    for (name, field) in columns {
        fields.push(arrow_field(name, field));
    }
    Arc::new(ArrowSchema::new(fields))
}

fn arrow_field(name: &str, field: &Field) -> ArrowField {
    ArrowField::new(name, arrow_type(field), true)
}

fn arrow_type(field: &Field) -> DataType {
    if let Some(element) = &field.repeated_field {
        return DataType::List(Arc::new(ArrowField::new("item", arrow_type(element), true)));
    }
    if let Some(dtype) = field.dtype {
        return scalar_arrow_type(dtype);
    }
    let children: Fields = field
        .fields
        .iter()
        .flat_map(|m| m.iter())
        .map(|(name, child)| Arc::new(arrow_field(name, child)))
        .collect();
    DataType::Struct(children)
}

fn scalar_arrow_type(dtype: DType) -> DataType {
    match dtype {
        DType::String => DataType::Utf8,
        DType::StringSpan => DataType::Struct(Fields::from(vec![
            ArrowField::new("start", DataType::UInt32, true),
            ArrowField::new("end", DataType::UInt32, true),
        ])),
        DType::Boolean => DataType::Boolean,
        DType::Binary => DataType::Binary,
        DType::Int8 => DataType::Int8,
        DType::Int16 => DataType::Int16,
        DType::Int32 => DataType::Int32,
        DType::Int64 => DataType::Int64,
        DType::UInt8 => DataType::UInt8,
        DType::UInt16 => DataType::UInt16,
        DType::UInt32 => DataType::UInt32,
        DType::UInt64 => DataType::UInt64,
        DType::Float16 | DType::Float32 => DataType::Float32,
        DType::Float64 => DataType::Float64,
        DType::Embedding => {
            DataType::List(Arc::new(ArrowField::new("item", DataType::Float32, true)))
        }
        DType::Date => DataType::Date32,
        DType::Time => DataType::Time64(TimeUnit::Microsecond),
        DType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        DType::Interval => DataType::Duration(TimeUnit::Microsecond),
    }
}

/// Convert shard rows to one record batch.
pub fn rows_to_batch(
    columns: &[(String, Field)],
    rows: &[ShardRow],
) -> Result<RecordBatch, SiftError> {
    let schema = shard_arrow_schema(columns);

    let row_ids: Vec<Option<&str>> = rows.iter().map(|r| Some(r.row_id.as_str())).collect();
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(StringArray::from(row_ids))];

    let index_values: Vec<Value> = rows
        .iter()
        .map(|r| {
            Value::List(
                r.index
                    .iter()
                    .map(|i| Value::Scalar(Scalar::UInt(*i as u64)))
                    .collect(),
            )
        })
        .collect();
    let index_field = Field::repeated(Field::of(DType::UInt32));
    let index_refs: Vec<&Value> = index_values.iter().collect();
    arrays.push(build_array(&index_field, &index_refs)?);

    for (name, field) in columns {
        let values: Vec<&Value> = rows
            .iter()
            .map(|r| r.values.get(name).unwrap_or(&Value::Null))
            .collect();
        arrays.push(build_array(field, &values)?);
    }

    RecordBatch::try_new(schema, arrays).map_err(Into::into)
}

/// Convert one record batch back to shard rows.
pub fn batch_to_rows(
    columns: &[(String, Field)],
    batch: &RecordBatch,
) -> Result<Vec<ShardRow>, SiftError> {
    let row_id_array = batch
        .column_by_name(ROW_ID_COLUMN)
        .and_then(|a| a.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| SiftError::Validation("shard missing __rowid__ column".to_string()))?;
    let index_array = batch
        .column_by_name(INDEX_COLUMN)
        .and_then(|a| a.as_any().downcast_ref::<ListArray>());

    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut index = Vec::new();
        if let Some(indices) = index_array {
            if !indices.is_null(row) {
                let slice = indices.value(row);
                let ints = slice
                    .as_any()
                    .downcast_ref::<UInt32Array>()
                    .ok_or_else(|| {
                        SiftError::Validation("__index__ must be list<uint32>".to_string())
                    })?;
                index = (0..ints.len()).map(|i| ints.value(i)).collect();
            }
        }
        let mut values = BTreeMap::new();
        for (name, field) in columns {
            let array = batch.column_by_name(name).ok_or_else(|| {
                SiftError::Validation(format!("shard missing column '{name}'"))
            })?;
            values.insert(name.clone(), read_value(field, array, row)?);
        }
        rows.push(ShardRow {
            row_id: row_id_array.value(row).to_string(),
            index,
            values,
        });
    }
    Ok(rows)
}

fn type_error(expected: &str) -> SiftError {
    SiftError::Validation(format!("value does not match shard column type '{expected}'"))
}

/// Build one arrow array for `values` shaped by `field`.
fn build_array(field: &Field, values: &[&Value]) -> Result<ArrayRef, SiftError> {
    if let Some(element) = &field.repeated_field {
        return build_list_array(element, values, |v| match v {
            Value::List(items) => Ok(items.iter().collect()),
            _ => Err(type_error("list")),
        });
    }
    if let Some(dtype) = field.dtype {
        return build_scalar_array(dtype, values);
    }
    let children = field
        .fields
        .as_ref()
        .ok_or_else(|| type_error("struct"))?;
    build_struct_array(children, values, |v, name| match v {
        Value::Struct(map) => Ok(map.get(name)),
        _ => Err(type_error("struct")),
    })
}

fn build_list_array<'a, F>(
    element: &Field,
    values: &[&'a Value],
    items_of: F,
) -> Result<ArrayRef, SiftError>
where
    F: Fn(&'a Value) -> Result<Vec<&'a Value>, SiftError>,
{
    let mut offsets: Vec<i32> = Vec::with_capacity(values.len() + 1);
    offsets.push(0);
    let mut validity: Vec<bool> = Vec::with_capacity(values.len());
    let mut flattened: Vec<&Value> = Vec::new();
    for value in values {
        match value {
            Value::Null => {
                validity.push(false);
            }
            other => {
                flattened.extend(items_of(other)?);
                validity.push(true);
            }
        }
        offsets.push(flattened.len() as i32);
    }
    let child = build_array(element, &flattened)?;
    let list = ListArray::new(
        Arc::new(ArrowField::new("item", child.data_type().clone(), true)),
        OffsetBuffer::new(ScalarBuffer::from(offsets)),
        child,
        Some(NullBuffer::from(validity)),
    );
    Ok(Arc::new(list))
}

fn build_struct_array<'a, F>(
    children: &BTreeMap<String, Field>,
    values: &[&'a Value],
    child_of: F,
) -> Result<ArrayRef, SiftError>
where
    F: Fn(&'a Value, &str) -> Result<Option<&'a Value>, SiftError>,
{
    let validity: Vec<bool> = values.iter().map(|v| !v.is_null()).collect();
    let mut fields = Vec::with_capacity(children.len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(children.len());
    for (name, child_field) in children {
        let child_values: Vec<&Value> = values
            .iter()
            .map(|v| match v {
                Value::Null => Ok(&Value::Null),
                other => Ok(child_of(other, name)?.unwrap_or(&Value::Null)),
            })
            .collect::<Result<_, SiftError>>()?;
        let array = build_array(child_field, &child_values)?;
        fields.push(Arc::new(ArrowField::new(
            name,
            array.data_type().clone(),
            true,
        )));
        arrays.push(array);
    }
    let array = StructArray::new(
        Fields::from(fields),
        arrays,
        Some(NullBuffer::from(validity)),
    );
    Ok(Arc::new(array))
}

fn build_scalar_array(dtype: DType, values: &[&Value]) -> Result<ArrayRef, SiftError> {
    macro_rules! primitive {
        ($arr:ty, $variant:pat => $expr:expr, $expected:literal) => {{
            let items: Vec<Option<_>> = values
                .iter()
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Scalar($variant) => Ok(Some($expr)),
                    _ => Err(type_error($expected)),
                })
                .collect::<Result<_, SiftError>>()?;
            Ok(Arc::new(<$arr>::from(items)) as ArrayRef)
        }};
    }

    match dtype {
        DType::String => {
            let items: Vec<Option<&str>> = values
                .iter()
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Scalar(Scalar::String(s)) => Ok(Some(s.as_str())),
                    _ => Err(type_error("string")),
                })
                .collect::<Result<_, SiftError>>()?;
            Ok(Arc::new(StringArray::from(items)) as ArrayRef)
        }
        DType::Boolean => primitive!(BooleanArray, Scalar::Bool(b) => *b, "boolean"),
        DType::Binary => {
            let items: Vec<Option<&[u8]>> = values
                .iter()
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Scalar(Scalar::Binary(b)) => Ok(Some(b.as_slice())),
                    _ => Err(type_error("binary")),
                })
                .collect::<Result<_, SiftError>>()?;
            Ok(Arc::new(BinaryArray::from_opt_vec(items)) as ArrayRef)
        }
        DType::Int8 => primitive!(Int8Array, Scalar::Int(i) => *i as i8, "int8"),
        DType::Int16 => primitive!(Int16Array, Scalar::Int(i) => *i as i16, "int16"),
        DType::Int32 => primitive!(Int32Array, Scalar::Int(i) => *i as i32, "int32"),
        DType::Int64 => primitive!(Int64Array, Scalar::Int(i) => *i, "int64"),
        DType::UInt8 => primitive!(UInt8Array, Scalar::UInt(u) => *u as u8, "uint8"),
        DType::UInt16 => primitive!(UInt16Array, Scalar::UInt(u) => *u as u16, "uint16"),
        DType::UInt32 => primitive!(UInt32Array, Scalar::UInt(u) => *u as u32, "uint32"),
        DType::UInt64 => primitive!(UInt64Array, Scalar::UInt(u) => *u, "uint64"),
        DType::Float16 | DType::Float32 => {
            primitive!(Float32Array, Scalar::Float(f) => *f as f32, "float32")
        }
        DType::Float64 => primitive!(Float64Array, Scalar::Float(f) => *f, "float64"),
        DType::Date => primitive!(
            Date32Array,
            Scalar::Date(d) => (*d - NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date"))
                .num_days() as i32,
            "date"
        ),
        DType::Time => {
            primitive!(Time64MicrosecondArray, Scalar::Time(t) => time_to_micros(t), "time")
        }
        DType::Timestamp => primitive!(
            TimestampMicrosecondArray,
            Scalar::Timestamp(ts) => ts.timestamp_micros(),
            "timestamp"
        ),
        DType::Interval => {
            primitive!(DurationMicrosecondArray, Scalar::Interval(us) => *us, "interval")
        }
        DType::Embedding => build_embedding_array(values),
        DType::StringSpan => {
            let starts: Vec<Option<u32>> = values
                .iter()
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Span { start, .. } => Ok(Some(*start)),
                    _ => Err(type_error("span")),
                })
                .collect::<Result<_, SiftError>>()?;
            let ends: Vec<Option<u32>> = values
                .iter()
                .map(|v| match v {
                    Value::Null => Ok(None),
                    Value::Span { end, .. } => Ok(Some(*end)),
                    _ => Err(type_error("span")),
                })
                .collect::<Result<_, SiftError>>()?;
            let validity: Vec<bool> = values.iter().map(|v| !v.is_null()).collect();
            let array = StructArray::new(
                Fields::from(vec![
                    ArrowField::new("start", DataType::UInt32, true),
                    ArrowField::new("end", DataType::UInt32, true),
                ]),
                vec![
                    Arc::new(UInt32Array::from(starts)) as ArrayRef,
                    Arc::new(UInt32Array::from(ends)) as ArrayRef,
                ],
                Some(NullBuffer::from(validity)),
            );
            Ok(Arc::new(array))
        }
    }
}

fn build_embedding_array(values: &[&Value]) -> Result<ArrayRef, SiftError> {
    let mut offsets: Vec<i32> = Vec::with_capacity(values.len() + 1);
    offsets.push(0);
    let mut validity: Vec<bool> = Vec::with_capacity(values.len());
    let mut floats: Vec<Option<f32>> = Vec::new();
    for value in values {
        match value {
            Value::Null => validity.push(false),
            Value::Scalar(Scalar::Embedding(v)) => {
                floats.extend(v.iter().map(|f| Some(*f)));
                validity.push(true);
            }
            _ => return Err(type_error("embedding")),
        }
        offsets.push(floats.len() as i32);
    }
    let list = ListArray::new(
        Arc::new(ArrowField::new("item", DataType::Float32, true)),
        OffsetBuffer::new(ScalarBuffer::from(offsets)),
        Arc::new(Float32Array::from(floats)),
        Some(NullBuffer::from(validity)),
    );
    Ok(Arc::new(list))
}

/// Read one value out of an arrow array at `row`.
fn read_value(field: &Field, array: &ArrayRef, row: usize) -> Result<Value, SiftError> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    if let Some(element) = &field.repeated_field {
        let list = array
            .as_any()
            .downcast_ref::<ListArray>()
            .ok_or_else(|| type_error("list"))?;
        let slice = list.value(row);
        let items = (0..slice.len())
            .map(|i| read_value(element, &slice, i))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Value::List(items));
    }
    if let Some(dtype) = field.dtype {
        return read_scalar(dtype, array, row);
    }
    let children = field.fields.as_ref().ok_or_else(|| type_error("struct"))?;
    let strukt = array
        .as_any()
        .downcast_ref::<StructArray>()
        .ok_or_else(|| type_error("struct"))?;
    let mut map = BTreeMap::new();
    for (name, child_field) in children {
        let column = strukt
            .column_by_name(name)
            .ok_or_else(|| SiftError::Validation(format!("struct missing child '{name}'")))?;
        map.insert(name.clone(), read_value(child_field, column, row)?);
    }
    Ok(Value::Struct(map))
}

fn read_scalar(dtype: DType, array: &ArrayRef, row: usize) -> Result<Value, SiftError> {
    macro_rules! primitive {
        ($arr:ty, $expected:literal, |$v:ident| $expr:expr) => {{
            let typed = array
                .as_any()
                .downcast_ref::<$arr>()
                .ok_or_else(|| type_error($expected))?;
            let $v = typed.value(row);
            Ok($expr)
        }};
    }

    match dtype {
        DType::String => {
            primitive!(StringArray, "string", |v| Value::string(v))
        }
        DType::Boolean => primitive!(BooleanArray, "boolean", |v| Value::bool(v)),
        DType::Binary => {
            primitive!(BinaryArray, "binary", |v| Value::Scalar(Scalar::Binary(
                v.to_vec()
            )))
        }
        DType::Int8 => primitive!(Int8Array, "int8", |v| Value::int(v as i64)),
        DType::Int16 => primitive!(Int16Array, "int16", |v| Value::int(v as i64)),
        DType::Int32 => primitive!(Int32Array, "int32", |v| Value::int(v as i64)),
        DType::Int64 => primitive!(Int64Array, "int64", |v| Value::int(v)),
        DType::UInt8 => {
            primitive!(UInt8Array, "uint8", |v| Value::Scalar(Scalar::UInt(v as u64)))
        }
        DType::UInt16 => {
            primitive!(UInt16Array, "uint16", |v| Value::Scalar(Scalar::UInt(v as u64)))
        }
        DType::UInt32 => {
            primitive!(UInt32Array, "uint32", |v| Value::Scalar(Scalar::UInt(v as u64)))
        }
        DType::UInt64 => {
            primitive!(UInt64Array, "uint64", |v| Value::Scalar(Scalar::UInt(v)))
        }
        DType::Float16 | DType::Float32 => {
            primitive!(Float32Array, "float32", |v| Value::float(v as f64))
        }
        DType::Float64 => primitive!(Float64Array, "float64", |v| Value::float(v)),
        DType::Date => primitive!(Date32Array, "date", |v| {
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date");
            Value::Scalar(Scalar::Date(epoch + chrono::Duration::days(v as i64)))
        }),
        DType::Time => primitive!(Time64MicrosecondArray, "time", |v| {
            let seconds = (v / 1_000_000) as u32;
            let nanos = ((v % 1_000_000) * 1_000) as u32;
            Value::Scalar(Scalar::Time(
                chrono::NaiveTime::from_num_seconds_from_midnight_opt(seconds, nanos)
                    .unwrap_or_default(),
            ))
        }),
        DType::Timestamp => primitive!(TimestampMicrosecondArray, "timestamp", |v| {
            Value::Scalar(Scalar::Timestamp(
                DateTime::from_timestamp_micros(v).unwrap_or_default(),
            ))
        }),
        DType::Interval => {
            primitive!(DurationMicrosecondArray, "interval", |v| Value::Scalar(
                Scalar::Interval(v)
            ))
        }
        DType::Embedding => {
            let list = array
                .as_any()
                .downcast_ref::<ListArray>()
                .ok_or_else(|| type_error("embedding"))?;
            let slice = list.value(row);
            let floats = slice
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| type_error("embedding"))?;
            Ok(Value::Scalar(Scalar::Embedding(
                (0..floats.len()).map(|i| floats.value(i)).collect(),
            )))
        }
        DType::StringSpan => {
            let strukt = array
                .as_any()
                .downcast_ref::<StructArray>()
                .ok_or_else(|| type_error("span"))?;
            let start = strukt
                .column_by_name("start")
                .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
                .ok_or_else(|| type_error("span"))?
                .value(row);
            let end = strukt
                .column_by_name("end")
                .and_then(|c| c.as_any().downcast_ref::<UInt32Array>())
                .ok_or_else(|| type_error("span"))?
                .value(row);
            Ok(Value::span(start, end))
        }
    }
}
