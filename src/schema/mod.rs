//! Nested, self-describing schema model.
//!
//! A [`Schema`] is a tree of [`Field`]s. Leaves carry a scalar [`DType`];
//! struct nodes carry named `fields`; list nodes carry a single
//! `repeated_field` describing each element. Derived subtrees produced by
//! enrichments carry a `signal` descriptor at their root and nest under the
//! source field they were computed from.

pub mod infer;
pub mod path;
pub mod value;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::signals::SignalDescriptor;

pub use infer::infer_schema;
pub use path::{Path, PathSegment, ROW_ID};
pub use value::{Scalar, Value, ValueNode};

/// Scalar data types a leaf field can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "string_span")]
    StringSpan,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "binary")]
    Binary,
    #[serde(rename = "int8")]
    Int8,
    #[serde(rename = "int16")]
    Int16,
    #[serde(rename = "int32")]
    Int32,
    #[serde(rename = "int64")]
    Int64,
    #[serde(rename = "uint8")]
    UInt8,
    #[serde(rename = "uint16")]
    UInt16,
    #[serde(rename = "uint32")]
    UInt32,
    #[serde(rename = "uint64")]
    UInt64,
    #[serde(rename = "float16")]
    Float16,
    #[serde(rename = "float32")]
    Float32,
    #[serde(rename = "float64")]
    Float64,
    #[serde(rename = "embedding")]
    Embedding,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "time")]
    Time,
    #[serde(rename = "timestamp")]
    Timestamp,
    #[serde(rename = "interval")]
    Interval,
}

impl DType {
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DType::Int8
                | DType::Int16
                | DType::Int32
                | DType::Int64
                | DType::UInt8
                | DType::UInt16
                | DType::UInt32
                | DType::UInt64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::Float16 | DType::Float32 | DType::Float64)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer() || self.is_float()
    }

    /// Types that support ordered comparison in filters and sorts.
    pub fn is_comparable(&self) -> bool {
        self.is_numeric()
            || matches!(
                self,
                DType::String | DType::Boolean | DType::Date | DType::Time | DType::Timestamp
            )
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_default();
        write!(f, "{s}")
    }
}

/// One node of the schema tree.
///
/// A source-schema node populates exactly one of `dtype`, `fields`,
/// `repeated_field`. In a *merged* view a leaf may additionally carry
/// derived children: every such child has `signal` set at its root and
/// identifies the enrichment that produced the subtree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Field {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, Field>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeated_field: Option<Box<Field>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalDescriptor>,
}

impl Field {
    pub fn of(dtype: DType) -> Self {
        Field {
            dtype: Some(dtype),
            ..Default::default()
        }
    }

    pub fn string() -> Self {
        Field::of(DType::String)
    }

    pub fn span() -> Self {
        Field::of(DType::StringSpan)
    }

    pub fn struct_of<I, S>(children: I) -> Self
    where
        I: IntoIterator<Item = (S, Field)>,
        S: Into<String>,
    {
        Field {
            fields: Some(
                children
                    .into_iter()
                    .map(|(name, field)| (name.into(), field))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    pub fn repeated(element: Field) -> Self {
        Field {
            repeated_field: Some(Box::new(element)),
            ..Default::default()
        }
    }

    pub fn with_signal(mut self, signal: SignalDescriptor) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.dtype.is_some()
    }

    /// Named children, including derived children on a merged leaf.
    pub fn child_fields(&self) -> impl Iterator<Item = (&String, &Field)> {
        self.fields.iter().flat_map(|m| m.iter())
    }

    /// Resolve one path segment against this field.
    pub fn child(&self, segment: &PathSegment) -> Option<&Field> {
        match segment {
            PathSegment::Name(name) => self.fields.as_ref().and_then(|m| m.get(name)),
            PathSegment::Index(_) | PathSegment::Wildcard => {
                self.repeated_field.as_deref()
            }
        }
    }

    fn child_mut(&mut self, segment: &PathSegment) -> Option<&mut Field> {
        match segment {
            PathSegment::Name(name) => self.fields.as_mut().and_then(|m| m.get_mut(name)),
            PathSegment::Index(_) | PathSegment::Wildcard => {
                self.repeated_field.as_deref_mut()
            }
        }
    }

    /// Walk a (concrete or wildcard) path from this field.
    pub fn descend(&self, path: &Path) -> Option<&Field> {
        let mut current = self;
        for segment in path.segments() {
            current = current.child(segment)?;
        }
        Some(current)
    }

    /// Structural validation of one subtree.
    ///
    /// `has_string_ancestor` is true when some ancestor on the walk carries
    /// `dtype=string` (spans anchor into it). `embedding_allowed` is true
    /// only when this field is the element struct of a repeated field that
    /// carries a `string_span` child — the one place an `embedding` leaf
    /// may live, one vector per chunk span.
    fn validate(
        &self,
        path: &Path,
        has_string_ancestor: bool,
        embedding_allowed: bool,
    ) -> Result<(), SchemaError> {
        let mut populated = 0;
        if self.dtype.is_some() {
            populated += 1;
        }
        if self.fields.is_some() {
            populated += 1;
        }
        if self.repeated_field.is_some() {
            populated += 1;
        }

        // A merged leaf may carry dtype plus derived (signal-rooted)
        // children; everything else must populate exactly one shape.
        let derived_leaf = self.dtype.is_some()
            && self.repeated_field.is_none()
            && self
                .fields
                .as_ref()
                .is_some_and(|m| m.values().all(|f| f.signal.is_some()));
        if populated != 1 && !derived_leaf {
            return Err(SchemaError::ChildrenConflict {
                path: path.to_string(),
            });
        }

        if self.dtype == Some(DType::StringSpan) && !has_string_ancestor {
            return Err(SchemaError::OrphanSpan {
                path: path.to_string(),
            });
        }

        let string_here = has_string_ancestor || self.dtype == Some(DType::String);

        if let Some(children) = &self.fields {
            for (name, child) in children {
                let child_path = path.child_name(name.clone());
                if child.dtype == Some(DType::Embedding) && !embedding_allowed {
                    return Err(SchemaError::OrphanSpan {
                        path: child_path.to_string(),
                    });
                }
                child.validate(&child_path, string_here, false)?;
            }
        }
        if let Some(element) = &self.repeated_field {
            let child_path = path.child(PathSegment::Wildcard);
            if element.dtype == Some(DType::Embedding) {
                return Err(SchemaError::OrphanSpan {
                    path: child_path.to_string(),
                });
            }
            let element_has_span = element
                .fields
                .as_ref()
                .is_some_and(|m| m.values().any(|f| f.dtype == Some(DType::StringSpan)));
            element.validate(&child_path, string_here, element_has_span)?;
        }
        Ok(())
    }
}

/// A full schema: named top-level fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub fields: BTreeMap<String, Field>,
}

impl Schema {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Field)>,
        S: Into<String>,
    {
        Schema {
            fields: fields
                .into_iter()
                .map(|(name, field)| (name.into(), field))
                .collect(),
        }
    }

    /// Deserialize and validate a raw schema document.
    pub fn from_json(raw: &serde_json::Value) -> Result<Self, SchemaError> {
        let schema: Schema =
            serde_json::from_value(raw.clone()).map_err(|e| SchemaError::InvalidDtype {
                dtype: e.to_string(),
                path: String::new(),
            })?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        for (name, field) in &self.fields {
            let path = Path::field(name.clone());
            if field.dtype == Some(DType::Embedding) {
                return Err(SchemaError::OrphanSpan {
                    path: path.to_string(),
                });
            }
            field.validate(&path, false, false)?;
        }
        Ok(())
    }

    pub fn has_path(&self, path: &Path) -> bool {
        self.get_field(path).is_ok()
    }

    /// Resolve a path to its field, failing with `UnknownPath`.
    pub fn get_field(&self, path: &Path) -> Result<&Field, SchemaError> {
        let not_found = || SchemaError::UnknownPath {
            path: path.to_string(),
        };
        let mut segments = path.segments().iter();
        let first = match segments.next() {
            Some(PathSegment::Name(name)) => self.fields.get(name).ok_or_else(not_found)?,
            _ => return Err(not_found()),
        };
        let mut current = first;
        for segment in segments {
            current = current.child(segment).ok_or_else(not_found)?;
        }
        Ok(current)
    }

    fn get_field_mut(&mut self, path: &Path) -> Option<&mut Field> {
        let mut segments = path.segments().iter();
        let first = match segments.next() {
            Some(PathSegment::Name(name)) => self.fields.get_mut(name)?,
            _ => return None,
        };
        let mut current = first;
        for segment in segments {
            current = current.child_mut(segment)?;
        }
        Some(current)
    }

    /// Attach a derived subtree under `parent_path` with the given name,
    /// producing the merged schema view of an enrichment.
    pub fn attach(
        &mut self,
        parent_path: &Path,
        name: &str,
        field: Field,
    ) -> Result<(), SchemaError> {
        if parent_path.is_empty() {
            self.fields.insert(name.to_string(), field);
            return Ok(());
        }
        let parent = self
            .get_field_mut(parent_path)
            .ok_or_else(|| SchemaError::UnknownPath {
                path: parent_path.to_string(),
            })?;
        parent
            .fields
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), field);
        Ok(())
    }

    /// All leaves with a scalar dtype — exactly the paths a query can
    /// project as scalars.
    pub fn petals(&self) -> Vec<(Path, &Field)> {
        let mut out = Vec::new();
        for (name, field) in &self.fields {
            collect_petals(field, &Path::field(name.clone()), &mut out);
        }
        out
    }
}

fn collect_petals<'a>(field: &'a Field, path: &Path, out: &mut Vec<(Path, &'a Field)>) {
    if field.dtype.is_some() {
        out.push((path.clone(), field));
    }
    if let Some(children) = &field.fields {
        for (name, child) in children {
            collect_petals(child, &path.child_name(name.clone()), out);
        }
    }
    if let Some(element) = &field.repeated_field {
        collect_petals(element, &path.child(PathSegment::Wildcard), out);
    }
}
