//! Schema inference for datasets created from in-memory items.
//!
//! Loaders live outside the engine; what arrives here is parsed JSON rows.
//! Inference unions the shapes seen across rows: integers widen to floats,
//! anything conflicting widens to string.

use std::collections::BTreeMap;

use crate::error::SiftError;
use crate::schema::{DType, Field, Schema};

/// Infer a schema from a non-empty slice of JSON items.
pub fn infer_schema(items: &[serde_json::Value]) -> Result<Schema, SiftError> {
    if items.is_empty() {
        return Err(SiftError::Validation(
            "cannot infer a schema from zero items".to_string(),
        ));
    }
    let mut fields: BTreeMap<String, Field> = BTreeMap::new();
    for item in items {
        let obj = item.as_object().ok_or_else(|| {
            SiftError::Validation(format!("dataset items must be objects, got {item}"))
        })?;
        for (name, value) in obj {
            if value.is_null() {
                continue;
            }
            let inferred = infer_field(value)?;
            match fields.remove(name) {
                None => {
                    fields.insert(name.clone(), inferred);
                }
                Some(existing) => {
                    fields.insert(name.clone(), unify(existing, inferred));
                }
            }
        }
    }
    if fields.is_empty() {
        return Err(SiftError::Validation(
            "no non-null fields found in items".to_string(),
        ));
    }
    Ok(Schema { fields })
}

fn infer_field(value: &serde_json::Value) -> Result<Field, SiftError> {
    Ok(match value {
        serde_json::Value::Null => Field::string(),
        serde_json::Value::Bool(_) => Field::of(DType::Boolean),
        serde_json::Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Field::of(DType::Int64)
            } else {
                Field::of(DType::Float64)
            }
        }
        serde_json::Value::String(_) => Field::string(),
        serde_json::Value::Array(items) => {
            let mut element: Option<Field> = None;
            for item in items {
                if item.is_null() {
                    continue;
                }
                let inferred = infer_field(item)?;
                element = Some(match element {
                    None => inferred,
                    Some(existing) => unify(existing, inferred),
                });
            }
            Field::repeated(element.unwrap_or_else(Field::string))
        }
        serde_json::Value::Object(map) => {
            let mut children = BTreeMap::new();
            for (name, child) in map {
                if child.is_null() {
                    continue;
                }
                children.insert(name.clone(), infer_field(child)?);
            }
            Field {
                fields: Some(children),
                ..Default::default()
            }
        }
    })
}

/// Union two inferred shapes; conflicts widen to string.
fn unify(a: Field, b: Field) -> Field {
    if a == b {
        return a;
    }
    match (a.dtype, b.dtype) {
        (Some(x), Some(y)) if x == y => a,
        (Some(DType::Int64), Some(DType::Float64)) | (Some(DType::Float64), Some(DType::Int64)) => {
            Field::of(DType::Float64)
        }
        (Some(_), Some(_)) => Field::string(),
        _ => match (a.repeated_field, b.repeated_field) {
            (Some(x), Some(y)) => Field::repeated(unify(*x, *y)),
            _ => match (a.fields, b.fields) {
                (Some(mut x), Some(y)) => {
                    for (name, field) in y {
                        match x.remove(&name) {
                            None => {
                                x.insert(name, field);
                            }
                            Some(existing) => {
                                x.insert(name, unify(existing, field));
                            }
                        }
                    }
                    Field {
                        fields: Some(x),
                        ..Default::default()
                    }
                }
                _ => Field::string(),
            },
        },
    }
}
