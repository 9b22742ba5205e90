//! Runtime value trees.
//!
//! A [`Value`] mirrors the schema shape at runtime: scalars at leaves,
//! lists under repeated fields, structs under named fields, and spans for
//! `string_span` leaves. Conversion to and from JSON is schema-guided so
//! the wire shape stays self-describing.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};

use crate::error::SiftError;
use crate::schema::path::{Path, PathSegment};
use crate::schema::{DType, Field};

/// Leaf payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    String(String),
    Bool(bool),
    Binary(Vec<u8>),
    Int(i64),
    UInt(u64),
    Float(f64),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    /// Microseconds.
    Interval(i64),
    Embedding(Vec<f32>),
}

/// A node of a runtime value tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Scalar(Scalar),
    List(Vec<Value>),
    Struct(BTreeMap<String, Value>),
    /// Character range `[start, end)` in UTF-8 bytes, anchored to an
    /// ancestor or sibling string.
    Span {
        start: u32,
        end: u32,
    },
}

/// A value with its concrete path — the `(value, path, field)` carrier;
/// the field is recovered from the schema via `get_field(path)`.
#[derive(Debug, Clone)]
pub struct ValueNode<'a> {
    pub value: &'a Value,
    pub path: Path,
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::Scalar(Scalar::String(s.into()))
    }

    pub fn int(i: i64) -> Self {
        Value::Scalar(Scalar::Int(i))
    }

    pub fn float(f: f64) -> Self {
        Value::Scalar(Scalar::Float(f))
    }

    pub fn bool(b: bool) -> Self {
        Value::Scalar(Scalar::Bool(b))
    }

    pub fn span(start: u32, end: u32) -> Self {
        Value::Span { start, end }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(Scalar::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Scalar(Scalar::Int(i)) => Some(*i as f64),
            Value::Scalar(Scalar::UInt(u)) => Some(*u as f64),
            Value::Scalar(Scalar::Float(f)) => Some(*f),
            _ => None,
        }
    }

    pub fn as_embedding(&self) -> Option<&[f32]> {
        match self {
            Value::Scalar(Scalar::Embedding(v)) => Some(v),
            _ => None,
        }
    }

    /// Length used by `length_greater` / `length_less` filters:
    /// characters for strings, element count for lists.
    pub fn length(&self) -> Option<usize> {
        match self {
            Value::Scalar(Scalar::String(s)) => Some(s.chars().count()),
            Value::List(items) => Some(items.len()),
            _ => None,
        }
    }

    /// Traverse a concrete (wildcard-free) path.
    pub fn at(&self, path: &Path) -> Option<&Value> {
        let mut current = self;
        for segment in path.segments() {
            current = match (current, segment) {
                (Value::Struct(map), PathSegment::Name(name)) => map.get(name)?,
                (Value::List(items), PathSegment::Index(i)) => items.get(*i as usize)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Resolve a path that may contain wildcards to every concrete match,
    /// pairing each with its resolved path.
    pub fn resolve<'a>(&'a self, path: &Path) -> Vec<(Path, &'a Value)> {
        let mut out = Vec::new();
        resolve_into(self, path.segments(), Path::default(), &mut out);
        out
    }

    /// Enumerate every leaf node (scalars and spans) with concrete paths.
    pub fn list_value_nodes<'a>(&'a self, base: &Path) -> Vec<ValueNode<'a>> {
        let mut out = Vec::new();
        collect_nodes(self, base.clone(), &mut out);
        out
    }

    /// JSON-shaped rendering of this value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Scalar(s) => scalar_to_json(s),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            Value::Struct(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Span { start, end } => serde_json::json!({ "start": start, "end": end }),
        }
    }

    /// Schema-guided conversion from JSON.
    pub fn from_json(field: &Field, json: &serde_json::Value) -> Result<Value, SiftError> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        if let Some(element) = &field.repeated_field {
            let arr = json.as_array().ok_or_else(|| {
                SiftError::Validation(format!("expected array, got {json}"))
            })?;
            return Ok(Value::List(
                arr.iter()
                    .map(|item| Value::from_json(element, item))
                    .collect::<Result<_, _>>()?,
            ));
        }
        if let Some(dtype) = field.dtype {
            return scalar_from_json(dtype, json);
        }
        if let Some(children) = &field.fields {
            let obj = json.as_object().ok_or_else(|| {
                SiftError::Validation(format!("expected object, got {json}"))
            })?;
            let mut map = BTreeMap::new();
            for (name, child) in children {
                let value = match obj.get(name) {
                    Some(v) => Value::from_json(child, v)?,
                    None => Value::Null,
                };
                map.insert(name.clone(), value);
            }
            return Ok(Value::Struct(map));
        }
        Ok(Value::Null)
    }
}

fn scalar_to_json(scalar: &Scalar) -> serde_json::Value {
    match scalar {
        Scalar::String(s) => serde_json::Value::String(s.clone()),
        Scalar::Bool(b) => serde_json::Value::Bool(*b),
        Scalar::Binary(bytes) => {
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        Scalar::Int(i) => serde_json::json!(i),
        Scalar::UInt(u) => serde_json::json!(u),
        Scalar::Float(f) => serde_json::json!(f),
        Scalar::Date(d) => serde_json::Value::String(d.to_string()),
        Scalar::Time(t) => serde_json::Value::String(t.to_string()),
        Scalar::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
        Scalar::Interval(micros) => serde_json::json!(micros),
        Scalar::Embedding(v) => serde_json::json!(v),
    }
}

fn scalar_from_json(dtype: DType, json: &serde_json::Value) -> Result<Value, SiftError> {
    let bad = |expected: &str| {
        SiftError::Validation(format!("expected {expected}, got {json}"))
    };
    let scalar = match dtype {
        DType::String => Scalar::String(json.as_str().ok_or_else(|| bad("string"))?.to_string()),
        DType::Boolean => Scalar::Bool(json.as_bool().ok_or_else(|| bad("boolean"))?),
        DType::Binary => {
            let s = json.as_str().ok_or_else(|| bad("base64 string"))?;
            Scalar::Binary(
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map_err(|e| SiftError::Validation(format!("invalid base64: {e}")))?,
            )
        }
        DType::Int8 | DType::Int16 | DType::Int32 | DType::Int64 => {
            Scalar::Int(json.as_i64().ok_or_else(|| bad("integer"))?)
        }
        DType::UInt8 | DType::UInt16 | DType::UInt32 | DType::UInt64 => {
            Scalar::UInt(json.as_u64().ok_or_else(|| bad("unsigned integer"))?)
        }
        DType::Float16 | DType::Float32 | DType::Float64 => {
            Scalar::Float(json.as_f64().ok_or_else(|| bad("float"))?)
        }
        DType::Date => {
            let s = json.as_str().ok_or_else(|| bad("date string"))?;
            Scalar::Date(
                s.parse()
                    .map_err(|e| SiftError::Validation(format!("invalid date: {e}")))?,
            )
        }
        DType::Time => {
            let s = json.as_str().ok_or_else(|| bad("time string"))?;
            Scalar::Time(
                s.parse()
                    .map_err(|e| SiftError::Validation(format!("invalid time: {e}")))?,
            )
        }
        DType::Timestamp => {
            let s = json.as_str().ok_or_else(|| bad("timestamp string"))?;
            Scalar::Timestamp(
                DateTime::parse_from_rfc3339(s)
                    .map_err(|e| SiftError::Validation(format!("invalid timestamp: {e}")))?
                    .with_timezone(&Utc),
            )
        }
        DType::Interval => Scalar::Interval(json.as_i64().ok_or_else(|| bad("microseconds"))?),
        DType::Embedding => {
            let arr = json.as_array().ok_or_else(|| bad("float array"))?;
            Scalar::Embedding(
                arr.iter()
                    .map(|v| v.as_f64().map(|f| f as f32).ok_or_else(|| bad("float")))
                    .collect::<Result<_, _>>()?,
            )
        }
        DType::StringSpan => {
            let obj = json.as_object().ok_or_else(|| bad("span object"))?;
            let start = obj.get("start").and_then(|v| v.as_u64()).ok_or_else(|| bad("span start"))?;
            let end = obj.get("end").and_then(|v| v.as_u64()).ok_or_else(|| bad("span end"))?;
            return Ok(Value::Span {
                start: start as u32,
                end: end as u32,
            });
        }
    };
    Ok(Value::Scalar(scalar))
}

fn resolve_into<'a>(
    value: &'a Value,
    segments: &[PathSegment],
    resolved: Path,
    out: &mut Vec<(Path, &'a Value)>,
) {
    let Some((segment, rest)) = segments.split_first() else {
        out.push((resolved, value));
        return;
    };
    match (value, segment) {
        (Value::Struct(map), PathSegment::Name(name)) => {
            if let Some(child) = map.get(name) {
                resolve_into(child, rest, resolved.child(segment.clone()), out);
            }
        }
        (Value::List(items), PathSegment::Index(i)) => {
            if let Some(child) = items.get(*i as usize) {
                resolve_into(child, rest, resolved.child(segment.clone()), out);
            }
        }
        (Value::List(items), PathSegment::Wildcard) => {
            for (i, child) in items.iter().enumerate() {
                resolve_into(child, rest, resolved.child(PathSegment::Index(i as u32)), out);
            }
        }
        _ => {}
    }
}

fn collect_nodes<'a>(value: &'a Value, path: Path, out: &mut Vec<ValueNode<'a>>) {
    match value {
        Value::Struct(map) => {
            for (name, child) in map {
                collect_nodes(child, path.child_name(name.clone()), out);
            }
        }
        Value::List(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_nodes(child, path.child(PathSegment::Index(i as u32)), out);
            }
        }
        _ => out.push(ValueNode { value, path }),
    }
}

/// Rebuild the nested list shape of a flattened repeated value from
/// `(index-path, element)` pairs. A single wildcard yields one list level,
/// nested wildcards yield nested lists. Missing indices become nulls.
pub fn assemble_from_elements(mut elements: Vec<(Vec<u32>, Value)>) -> Value {
    if elements.is_empty() {
        return Value::List(Vec::new());
    }
    if elements.len() == 1 && elements[0].0.is_empty() {
        return elements.pop().expect("len checked").1;
    }
    elements.sort_by(|a, b| a.0.cmp(&b.0));
    let max_index = elements
        .iter()
        .filter_map(|(idx, _)| idx.first().copied())
        .max()
        .unwrap_or(0) as usize;
    let mut buckets: Vec<Vec<(Vec<u32>, Value)>> = vec![Vec::new(); max_index + 1];
    for (idx, value) in elements {
        let Some((first, rest)) = idx.split_first() else {
            continue;
        };
        buckets[*first as usize].push((rest.to_vec(), value));
    }
    Value::List(
        buckets
            .into_iter()
            .map(|bucket| {
                if bucket.is_empty() {
                    Value::Null
                } else {
                    assemble_from_elements(bucket)
                }
            })
            .collect(),
    )
}

/// Total ordering over values for sorts and top-K heaps.
///
/// Nulls sort after everything; scalars of incompatible kinds order by a
/// stable type rank so heterogeneous columns still sort deterministically.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Scalar(x), Value::Scalar(y)) => compare_scalars(x, y),
        (Value::Span { start: s1, end: e1 }, Value::Span { start: s2, end: e2 }) => {
            (s1, e1).cmp(&(s2, e2))
        }
        (Value::List(x), Value::List(y)) => {
            for (a, b) in x.iter().zip(y.iter()) {
                let ord = compare_values(a, b);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare_scalars(a: &Scalar, b: &Scalar) -> Ordering {
    use Scalar::*;
    match (a, b) {
        (String(x), String(y)) => x.cmp(y),
        (Bool(x), Bool(y)) => x.cmp(y),
        (Binary(x), Binary(y)) => x.cmp(y),
        (Date(x), Date(y)) => x.cmp(y),
        (Time(x), Time(y)) => x.cmp(y),
        (Timestamp(x), Timestamp(y)) => x.cmp(y),
        (Interval(x), Interval(y)) => x.cmp(y),
        _ => {
            let (xf, yf) = (scalar_as_f64(a), scalar_as_f64(b));
            match (xf, yf) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => scalar_rank(a).cmp(&scalar_rank(b)),
            }
        }
    }
}

fn scalar_as_f64(s: &Scalar) -> Option<f64> {
    match s {
        Scalar::Int(i) => Some(*i as f64),
        Scalar::UInt(u) => Some(*u as f64),
        Scalar::Float(f) => Some(*f),
        _ => None,
    }
}

fn scalar_rank(s: &Scalar) -> u8 {
    match s {
        Scalar::Bool(_) => 0,
        Scalar::Int(_) | Scalar::UInt(_) | Scalar::Float(_) => 1,
        Scalar::String(_) => 2,
        Scalar::Binary(_) => 3,
        Scalar::Date(_) => 4,
        Scalar::Time(_) => 5,
        Scalar::Timestamp(_) => 6,
        Scalar::Interval(_) => 7,
        Scalar::Embedding(_) => 8,
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Scalar(_) => 0,
        Value::Span { .. } => 1,
        Value::List(_) => 2,
        Value::Struct(_) => 3,
        Value::Null => 4,
    }
}

/// Microseconds since midnight, for arrow time columns.
pub fn time_to_micros(t: &NaiveTime) -> i64 {
    t.num_seconds_from_midnight() as i64 * 1_000_000 + (t.nanosecond() / 1_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    fn row() -> Value {
        Value::Struct(BTreeMap::from([
            ("q".to_string(), Value::string("A")),
            (
                "qs".to_string(),
                Value::List(vec![Value::string("x"), Value::string("y")]),
            ),
            (
                "meta".to_string(),
                Value::Struct(BTreeMap::from([("stars".to_string(), Value::int(3))])),
            ),
        ]))
    }

    #[test]
    fn test_at_concrete_path() {
        let r = row();
        assert_eq!(r.at(&"qs.1".into()), Some(&Value::string("y")));
        assert_eq!(r.at(&"meta.stars".into()), Some(&Value::int(3)));
        assert_eq!(r.at(&"meta.missing".into()), None);
    }

    #[test]
    fn test_resolve_wildcard() {
        let r = row();
        let matches = r.resolve(&"qs.*".into());
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].0.to_string(), "qs.0");
        assert_eq!(matches[1].1, &Value::string("y"));
    }

    #[test]
    fn test_list_value_nodes_paths_resolve_in_schema() {
        let schema = Schema::new([
            ("q", Field::string()),
            ("qs", Field::repeated(Field::string())),
            ("meta", Field::struct_of([("stars", Field::of(DType::Int64))])),
        ]);
        let r = row();
        for node in r.list_value_nodes(&Path::default()) {
            schema
                .get_field(&node.path)
                .expect("every value node path resolves to a field");
        }
    }

    #[test]
    fn test_json_round_trip_guided_by_schema() {
        let field = Field::struct_of([
            ("name", Field::string()),
            ("tags", Field::repeated(Field::string())),
            ("n", Field::of(DType::Int64)),
        ]);
        let json = serde_json::json!({"name": "a", "tags": ["t1", "t2"], "n": 7});
        let value = Value::from_json(&field, &json).unwrap();
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_assemble_from_elements_rebuilds_lists() {
        let assembled = assemble_from_elements(vec![
            (vec![1], Value::string("b")),
            (vec![0], Value::string("a")),
        ]);
        assert_eq!(
            assembled,
            Value::List(vec![Value::string("a"), Value::string("b")])
        );
    }

    #[test]
    fn test_compare_nulls_last() {
        assert_eq!(
            compare_values(&Value::Null, &Value::int(1)),
            Ordering::Greater
        );
        assert_eq!(compare_values(&Value::int(1), &Value::Null), Ordering::Less);
        assert_eq!(
            compare_values(&Value::int(2), &Value::float(2.5)),
            Ordering::Less
        );
    }
}
