//! Concept store: labeled text examples defining binary scorers.
//!
//! A concept is a set of positive/negative example texts under a
//! `(namespace, name)` key. Edits bump the version; trained models are
//! cached per `(version, embedding)` by the scorer in [`model`].

pub mod model;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{ConceptError, SiftError};
use crate::utils::fs::atomic_write_json;

pub use model::{Calibration, ConceptMetrics, ConceptModel, ConceptScorer};

/// Kind of data a concept scores. Only text is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConceptType {
    Text,
}

/// One labeled example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub id: String,
    pub label: bool,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// A new example to insert (id assigned by the store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExampleIn {
    pub label: bool,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// A concept: namespace, name, type, versioned examples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub namespace: String,
    pub name: String,
    #[serde(rename = "type")]
    pub concept_type: ConceptType,
    pub version: u64,
    pub examples: Vec<Example>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Concept {
    pub fn num_positives(&self) -> usize {
        self.examples.iter().filter(|e| e.label).count()
    }

    pub fn num_negatives(&self) -> usize {
        self.examples.iter().filter(|e| !e.label).count()
    }

    /// Content hash over examples — the model-cache key component.
    pub fn examples_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for example in &self.examples {
            hasher.update(example.id.as_bytes());
            hasher.update(&[example.label as u8]);
            hasher.update(example.text.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// An edit applied to a concept's example set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConceptEdit {
    #[serde(default)]
    pub insert: Vec<ExampleIn>,
    /// Example ids to remove.
    #[serde(default)]
    pub remove: Vec<String>,
    /// Full replacements addressed by id.
    #[serde(default)]
    pub update: Vec<Example>,
    /// Optimistic concurrency check against the stored version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

/// File-backed concept store: one JSON file per `(namespace, name)`.
pub struct ConceptStore {
    root: PathBuf,
    write_lock: std::sync::Mutex<()>,
}

impl ConceptStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: std::sync::Mutex::new(()),
        }
    }

    fn concept_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{name}.json"))
    }

    pub fn create(
        &self,
        namespace: &str,
        name: &str,
        concept_type: ConceptType,
    ) -> Result<Concept, SiftError> {
        let _guard = self.write_lock.lock().expect("concept store lock poisoned");
        let path = self.concept_path(namespace, name);
        if path.exists() {
            return Err(SiftError::Validation(format!(
                "concept '{namespace}/{name}' already exists"
            )));
        }
        let now = Utc::now();
        let concept = Concept {
            namespace: namespace.to_string(),
            name: name.to_string(),
            concept_type,
            version: 0,
            examples: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        self.save(&concept)?;
        info!("Created concept {namespace}/{name}");
        Ok(concept)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<Concept, SiftError> {
        let path = self.concept_path(namespace, name);
        if !path.exists() {
            return Err(ConceptError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
            .into());
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn edit(
        &self,
        namespace: &str,
        name: &str,
        edit: ConceptEdit,
    ) -> Result<Concept, SiftError> {
        let _guard = self.write_lock.lock().expect("concept store lock poisoned");
        let mut concept = self.get(namespace, name)?;

        if let Some(expected) = edit.expected_version {
            if expected != concept.version {
                return Err(ConceptError::VersionStale {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    expected,
                    actual: concept.version,
                }
                .into());
            }
        }

        let mut by_id: BTreeMap<String, Example> = concept
            .examples
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();

        for id in &edit.remove {
            by_id.remove(id);
        }
        for updated in edit.update {
            if !by_id.contains_key(&updated.id) {
                return Err(SiftError::Validation(format!(
                    "cannot update unknown example '{}'",
                    updated.id
                )));
            }
            by_id.insert(updated.id.clone(), updated);
        }
        for new in edit.insert {
            let example = Example {
                id: Uuid::new_v4().to_string(),
                label: new.label,
                text: new.text,
                origin: new.origin,
            };
            by_id.insert(example.id.clone(), example);
        }

        concept.examples = by_id.into_values().collect();
        concept.version += 1;
        concept.updated_at = Utc::now();
        self.save(&concept)?;
        Ok(concept)
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Result<(), SiftError> {
        let _guard = self.write_lock.lock().expect("concept store lock poisoned");
        let path = self.concept_path(namespace, name);
        if !path.exists() {
            return Err(ConceptError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
            .into());
        }
        std::fs::remove_file(&path)?;
        info!("Removed concept {namespace}/{name}");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<(String, String)>, SiftError> {
        let mut out = Vec::new();
        if !self.root.exists() {
            return Ok(out);
        }
        for ns_entry in std::fs::read_dir(&self.root)? {
            let ns_entry = ns_entry?;
            if !ns_entry.file_type()?.is_dir() {
                continue;
            }
            let namespace = ns_entry.file_name().to_string_lossy().into_owned();
            for file in std::fs::read_dir(ns_entry.path())? {
                let file = file?;
                let file_name = file.file_name().to_string_lossy().into_owned();
                if let Some(name) = file_name.strip_suffix(".json") {
                    out.push((namespace.clone(), name.to_string()));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn save(&self, concept: &Concept) -> Result<(), SiftError> {
        let path = self.concept_path(&concept.namespace, &concept.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        atomic_write_json(&path, concept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ConceptStore) {
        let dir = TempDir::new().unwrap();
        let store = ConceptStore::new(dir.path().join("concepts"));
        (dir, store)
    }

    #[test]
    fn test_create_get_remove() {
        let (_dir, store) = store();
        store.create("local", "spam", ConceptType::Text).unwrap();
        let concept = store.get("local", "spam").unwrap();
        assert_eq!(concept.version, 0);
        assert!(concept.examples.is_empty());
        store.remove("local", "spam").unwrap();
        assert!(matches!(
            store.get("local", "spam"),
            Err(SiftError::Concept(ConceptError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_edit_bumps_version_and_assigns_ids() {
        let (_dir, store) = store();
        store.create("local", "spam", ConceptType::Text).unwrap();
        let concept = store
            .edit(
                "local",
                "spam",
                ConceptEdit {
                    insert: vec![
                        ExampleIn {
                            label: true,
                            text: "buy now!!!".to_string(),
                            origin: None,
                        },
                        ExampleIn {
                            label: false,
                            text: "see you tomorrow".to_string(),
                            origin: None,
                        },
                    ],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(concept.version, 1);
        assert_eq!(concept.examples.len(), 2);
        assert!(concept.examples.iter().all(|e| !e.id.is_empty()));
        assert_eq!(concept.num_positives(), 1);
        assert_eq!(concept.num_negatives(), 1);
    }

    #[test]
    fn test_stale_version_rejected() {
        let (_dir, store) = store();
        store.create("local", "spam", ConceptType::Text).unwrap();
        let result = store.edit(
            "local",
            "spam",
            ConceptEdit {
                expected_version: Some(7),
                ..Default::default()
            },
        );
        assert!(matches!(
            result,
            Err(SiftError::Concept(ConceptError::VersionStale { .. }))
        ));
    }

    #[test]
    fn test_examples_hash_changes_on_edit() {
        let (_dir, store) = store();
        store.create("local", "spam", ConceptType::Text).unwrap();
        let before = store.get("local", "spam").unwrap().examples_hash();
        let after = store
            .edit(
                "local",
                "spam",
                ConceptEdit {
                    insert: vec![ExampleIn {
                        label: true,
                        text: "x".to_string(),
                        origin: None,
                    }],
                    ..Default::default()
                },
            )
            .unwrap()
            .examples_hash();
        assert_ne!(before, after);
    }
}
