//! Near-duplicate clustering via minhash-LSH.
//!
//! Each document gets a minhash signature over word shingles; signatures
//! are banded and documents sharing any band bucket are unioned into one
//! cluster. Same cluster id ⇒ near-duplicate candidates. Clusters are
//! scoped to the batch handed to `compute` — run with `batch_size = -1`
//! to cluster a whole column.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SiftError;
use crate::schema::{DType, Field, Scalar, Value};
use crate::signals::{Signal, SignalDescriptor, SignalInput};

pub const NAME: &str = "near_dup";

const SHINGLE_SIZE: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NearDupParams {
    /// Number of minhash permutations; must be bands * rows.
    #[serde(default = "default_num_perm")]
    pub num_perm: usize,
    #[serde(default = "default_bands")]
    pub bands: usize,
}

fn default_num_perm() -> usize {
    64
}

fn default_bands() -> usize {
    8
}

impl Default for NearDupParams {
    fn default() -> Self {
        Self {
            num_perm: default_num_perm(),
            bands: default_bands(),
        }
    }
}

pub struct NearDupSignal {
    params: NearDupParams,
}

impl NearDupSignal {
    pub fn new(params: NearDupParams) -> Self {
        Self { params }
    }

    fn signature(&self, text: &str) -> Vec<u64> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let shingles: Vec<String> = if words.len() < SHINGLE_SIZE {
            vec![text.to_lowercase()]
        } else {
            words
                .windows(SHINGLE_SIZE)
                .map(|w| w.join(" ").to_lowercase())
                .collect()
        };

        let mut signature = vec![u64::MAX; self.params.num_perm];
        for shingle in &shingles {
            let h1 = murmur3::murmur3_32(&mut Cursor::new(shingle.as_bytes()), 0)
                .expect("murmur3 over an in-memory cursor cannot fail") as u64;
            let h2 = murmur3::murmur3_32(&mut Cursor::new(shingle.as_bytes()), 1)
                .expect("murmur3 over an in-memory cursor cannot fail") as u64;
            for (i, slot) in signature.iter_mut().enumerate() {
                // Kirsch-Mitzenmacher: h_i = h1 + i * h2.
                let h = h1.wrapping_add((i as u64).wrapping_mul(h2));
                if h < *slot {
                    *slot = h;
                }
            }
        }
        signature
    }
}

#[async_trait]
impl Signal for NearDupSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new(
            NAME,
            serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null),
        )
    }

    fn output_schema(&self) -> Field {
        Field::struct_of([("cluster_id", Field::of(DType::UInt32))])
    }

    async fn compute(&self, inputs: &[SignalInput]) -> Result<Vec<Option<Value>>, SiftError> {
        let signatures: Vec<Vec<u64>> = inputs
            .iter()
            .map(|input| Ok(self.signature(input.as_text()?)))
            .collect::<Result<_, SiftError>>()?;

        let rows_per_band = (self.params.num_perm / self.params.bands).max(1);
        let mut parent: Vec<usize> = (0..signatures.len()).collect();

        fn find(parent: &mut [usize], mut i: usize) -> usize {
            while parent[i] != i {
                parent[i] = parent[parent[i]];
                i = parent[i];
            }
            i
        }

        let mut buckets: HashMap<(usize, Vec<u64>), usize> = HashMap::new();
        for (doc, signature) in signatures.iter().enumerate() {
            for band in 0..self.params.bands {
                let lo = band * rows_per_band;
                let hi = (lo + rows_per_band).min(signature.len());
                let key = (band, signature[lo..hi].to_vec());
                match buckets.get(&key) {
                    Some(&other) => {
                        let (a, b) = (find(&mut parent, doc), find(&mut parent, other));
                        if a != b {
                            parent[a] = b;
                        }
                    }
                    None => {
                        buckets.insert(key, doc);
                    }
                }
            }
        }

        // Dense cluster ids in first-occurrence order.
        let mut cluster_of_root: HashMap<usize, u32> = HashMap::new();
        let mut out = Vec::with_capacity(signatures.len());
        for doc in 0..signatures.len() {
            let root = find(&mut parent, doc);
            let next = cluster_of_root.len() as u32;
            let cluster = *cluster_of_root.entry(root).or_insert(next);
            out.push(Some(Value::Struct(BTreeMap::from([(
                "cluster_id".to_string(),
                Value::Scalar(Scalar::UInt(cluster as u64)),
            )]))));
        }
        Ok(out)
    }
}
