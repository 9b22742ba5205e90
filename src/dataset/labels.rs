//! User-applied labels over row selections.
//!
//! One JSON file per dataset: `row_id → label_name → {label, created}`.
//! Labels are first-class projectable paths and drive the
//! `include_labels` / `exclude_labels` query options.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SiftError;
use crate::utils::fs::{atomic_write_json, read_json};

pub const LABELS_FILE: &str = "labels.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRecord {
    pub label: bool,
    pub created: DateTime<Utc>,
}

type LabelMap = BTreeMap<String, BTreeMap<String, LabelRecord>>;

/// File-backed label store for one dataset.
pub struct LabelStore {
    path: PathBuf,
    state: Mutex<LabelMap>,
}

impl LabelStore {
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self, SiftError> {
        let path = path.into();
        let state = if path.exists() {
            read_json(&path)?
        } else {
            LabelMap::new()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Apply `label_name` to the rows; returns how many rows changed.
    pub fn add(&self, label_name: &str, row_ids: &[String]) -> Result<usize, SiftError> {
        let mut state = self.state.lock().expect("label store lock poisoned");
        let mut changed = 0;
        for row_id in row_ids {
            let labels = state.entry(row_id.clone()).or_default();
            if !labels.contains_key(label_name) {
                labels.insert(
                    label_name.to_string(),
                    LabelRecord {
                        label: true,
                        created: Utc::now(),
                    },
                );
                changed += 1;
            }
        }
        atomic_write_json(&self.path, &*state)?;
        Ok(changed)
    }

    /// Remove `label_name` from the rows; returns how many rows changed.
    pub fn remove(&self, label_name: &str, row_ids: &[String]) -> Result<usize, SiftError> {
        let mut state = self.state.lock().expect("label store lock poisoned");
        let mut changed = 0;
        for row_id in row_ids {
            if let Some(labels) = state.get_mut(row_id) {
                if labels.remove(label_name).is_some() {
                    changed += 1;
                }
                if labels.is_empty() {
                    state.remove(row_id);
                }
            }
        }
        atomic_write_json(&self.path, &*state)?;
        Ok(changed)
    }

    pub fn has_label(&self, row_id: &str, label_name: &str) -> bool {
        self.state
            .lock()
            .expect("label store lock poisoned")
            .get(row_id)
            .is_some_and(|labels| labels.contains_key(label_name))
    }

    /// Labels on one row.
    pub fn labels_for(&self, row_id: &str) -> BTreeMap<String, LabelRecord> {
        self.state
            .lock()
            .expect("label store lock poisoned")
            .get(row_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every label name in use.
    pub fn label_names(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .expect("label store lock poisoned")
            .values()
            .flat_map(|labels| labels.keys().cloned())
            .collect()
    }
}
