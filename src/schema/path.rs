//! Path algebra for addressing nodes in nested rows.
//!
//! A path is a dot-separated sequence of segments: field names, numeric
//! indices, or the wildcard `*` meaning "every element of a repeated field".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reserved path of the per-row identifier column.
pub const ROW_ID: &str = "__rowid__";

/// One segment of a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    /// Named field of a struct.
    Name(String),
    /// Concrete element index of a repeated field.
    Index(u32),
    /// Every element of a repeated field.
    Wildcard,
}

impl PathSegment {
    /// Pairwise segment match: equal, or either side is the wildcard.
    pub fn matches(&self, other: &PathSegment) -> bool {
        matches!(self, PathSegment::Wildcard)
            || matches!(other, PathSegment::Wildcard)
            || self == other
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Name(name) => write!(f, "{name}"),
            PathSegment::Index(i) => write!(f, "{i}"),
            PathSegment::Wildcard => write!(f, "*"),
        }
    }
}

/// An ordered sequence of segments addressing a node in a nested value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    /// Path with a single named segment.
    pub fn field(name: impl Into<String>) -> Self {
        Self {
            segments: vec![PathSegment::Name(name.into())],
        }
    }

    /// The reserved row-id path.
    pub fn row_id() -> Self {
        Self::field(ROW_ID)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first(&self) -> Option<&PathSegment> {
        self.segments.first()
    }

    pub fn last(&self) -> Option<&PathSegment> {
        self.segments.last()
    }

    /// Append a segment, returning the extended path.
    pub fn child(&self, segment: PathSegment) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }

    /// Append a named segment.
    pub fn child_name(&self, name: impl Into<String>) -> Self {
        self.child(PathSegment::Name(name.into()))
    }

    /// Concatenate two paths.
    pub fn join(&self, other: &Path) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    /// Everything but the last segment; `None` for the empty path.
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Whether this path contains a wildcard segment.
    pub fn has_wildcard(&self) -> bool {
        self.segments.contains(&PathSegment::Wildcard)
    }

    /// Two paths match if they have equal length and each segment pair is
    /// equal or one side is the wildcard.
    pub fn matches(&self, other: &Path) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a.matches(b))
    }

    /// `self` includes `other` if `other` is a (wildcard-tolerant) prefix
    /// of `self`.
    pub fn includes(&self, other: &Path) -> bool {
        other.segments.len() <= self.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a.matches(b))
    }

    /// Concrete copy of this path with wildcards replaced by indices from
    /// `indices`, consumed in order. Extra wildcards stay as-is.
    pub fn resolve_wildcards(&self, indices: &[u32]) -> Self {
        let mut it = indices.iter();
        let segments = self
            .segments
            .iter()
            .map(|seg| match seg {
                PathSegment::Wildcard => it
                    .next()
                    .map(|i| PathSegment::Index(*i))
                    .unwrap_or(PathSegment::Wildcard),
                other => other.clone(),
            })
            .collect();
        Self { segments }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.segments.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl FromStr for Path {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Path::default());
        }
        let segments = s
            .split('.')
            .map(|part| {
                if part == "*" {
                    PathSegment::Wildcard
                } else if let Ok(i) = part.parse::<u32>() {
                    PathSegment::Index(i)
                } else {
                    PathSegment::Name(part.to_string())
                }
            })
            .collect();
        Ok(Path { segments })
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        s.parse().expect("path parsing is infallible")
    }
}

impl From<Vec<&str>> for Path {
    fn from(parts: Vec<&str>) -> Self {
        let joined = parts.join(".");
        joined.as_str().into()
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(s.as_str().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_round_trip() {
        let path: Path = "text.pii.*.span".into();
        assert_eq!(path.to_string(), "text.pii.*.span");
        assert_eq!(path.len(), 4);
        assert_eq!(path.segments()[2], PathSegment::Wildcard);
    }

    #[test]
    fn test_numeric_segment_parses_as_index() {
        let path: Path = "qs.3".into();
        assert_eq!(path.segments()[1], PathSegment::Index(3));
    }

    #[test]
    fn test_matches_wildcard_either_side() {
        let concrete: Path = "qs.2".into();
        let wild: Path = "qs.*".into();
        assert!(concrete.matches(&wild));
        assert!(wild.matches(&concrete));
        assert!(!concrete.matches(&"qs".into()));
    }

    #[test]
    fn test_includes_prefix() {
        let deep: Path = "text.pii.0.span".into();
        assert!(deep.includes(&"text".into()));
        assert!(deep.includes(&"text.pii.*".into()));
        assert!(!deep.includes(&"other".into()));
        assert!(!"text".parse::<Path>().unwrap().includes(&deep));
    }

    #[test]
    fn test_resolve_wildcards() {
        let path: Path = "qs.*.words.*".into();
        let resolved = path.resolve_wildcards(&[1, 4]);
        assert_eq!(resolved.to_string(), "qs.1.words.4");
    }

    #[test]
    fn test_parent_and_child() {
        let path: Path = "a.b".into();
        assert_eq!(path.parent().unwrap().to_string(), "a");
        assert_eq!(path.child_name("c").to_string(), "a.b.c");
        assert!(Path::default().parent().is_none());
    }

    #[test]
    fn test_serde_as_string() {
        let path: Path = "text.*".into();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"text.*\"");
        let back: Path = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }

    // -- Property-based tests --

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_segment() -> impl Strategy<Value = PathSegment> {
            prop_oneof![
                "[a-z][a-z0-9_]{0,8}".prop_map(PathSegment::Name),
                (0u32..100).prop_map(PathSegment::Index),
                Just(PathSegment::Wildcard),
            ]
        }

        fn arb_path() -> impl Strategy<Value = Path> {
            proptest::collection::vec(arb_segment(), 0..6).prop_map(Path::new)
        }

        proptest! {
            #[test]
            fn prop_display_parse_round_trip(path in arb_path()) {
                let parsed: Path = path.to_string().as_str().into();
                prop_assert_eq!(parsed, path);
            }

            #[test]
            fn prop_matches_is_symmetric(a in arb_path(), b in arb_path()) {
                prop_assert_eq!(a.matches(&b), b.matches(&a));
            }

            #[test]
            fn prop_path_matches_itself(path in arb_path()) {
                prop_assert!(path.matches(&path));
                prop_assert!(path.includes(&path));
            }

            #[test]
            fn prop_includes_every_prefix(path in arb_path()) {
                for len in 0..=path.len() {
                    let prefix = Path::new(path.segments()[..len].to_vec());
                    prop_assert!(path.includes(&prefix));
                }
            }

            #[test]
            fn prop_child_extends_and_parent_undoes(path in arb_path(), name in "[a-z]{1,6}") {
                let child = path.child_name(name);
                prop_assert_eq!(child.parent().unwrap(), path);
            }
        }
    }
}
