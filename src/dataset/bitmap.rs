//! Durable completed-row bitmaps.
//!
//! One bit per source row of an enrichment. The bitmap is fsynced before
//! the manifest entry that claims those rows, so after a crash the set
//! bits are exactly the rows whose values are durable in shard parts.

use std::path::PathBuf;

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::SiftError;
use crate::utils::fs::{atomic_write_json, read_json};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BitmapFile {
    len: usize,
    bits: BitVec<u8, Lsb0>,
}

/// Completed-row bitmap persisted beside its enrichment shard.
#[derive(Debug)]
pub struct CompletedBitmap {
    path: PathBuf,
    bits: BitVec<u8, Lsb0>,
}

impl CompletedBitmap {
    /// Load an existing bitmap or create an all-zeros one of `len` bits.
    pub fn load_or_create(path: impl Into<PathBuf>, len: usize) -> Result<Self, SiftError> {
        let path = path.into();
        if path.exists() {
            let file: BitmapFile = read_json(&path)?;
            let mut bits = file.bits;
            bits.resize(len, false);
            return Ok(Self { path, bits });
        }
        Ok(Self {
            path,
            bits: bitvec![u8, Lsb0; 0; len],
        })
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn set(&mut self, index: usize) {
        if index < self.bits.len() {
            self.bits.set(index, true);
        }
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn is_complete(&self) -> bool {
        self.bits.all()
    }

    /// Indices still missing, ascending.
    pub fn missing(&self) -> Vec<usize> {
        self.bits.iter_zeros().collect()
    }

    /// Durably persist; must happen before the manifest update that makes
    /// these rows visible.
    pub fn save(&self) -> Result<(), SiftError> {
        let file = BitmapFile {
            len: self.bits.len(),
            bits: self.bits.clone(),
        };
        atomic_write_json(&self.path, &file)
    }
}
