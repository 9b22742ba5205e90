//! Lazy per-column statistics with an in-process cache.

use serde::Serialize;
use std::collections::HashSet;

use crate::schema::value::compare_values;
use crate::schema::Value;

/// Distinct counting stops being exact past this many values.
const DISTINCT_CAP: usize = 10_000;

#[derive(Debug, Clone, Serialize)]
pub struct ColumnStats {
    pub total_count: usize,
    pub null_count: usize,
    /// Exact up to the cap, capped beyond it.
    pub approx_distinct: usize,
    pub min: Option<serde_json::Value>,
    pub max: Option<serde_json::Value>,
    /// Mean character length, string columns only.
    pub avg_len: Option<f64>,
}

/// Compute stats over a column's values (lists are flattened upstream).
pub fn compute_stats<I: IntoIterator<Item = Value>>(values: I) -> ColumnStats {
    let mut total_count = 0;
    let mut null_count = 0;
    let mut distinct: HashSet<String> = HashSet::new();
    let mut min: Option<Value> = None;
    let mut max: Option<Value> = None;
    let mut len_sum = 0usize;
    let mut len_count = 0usize;

    for value in values {
        total_count += 1;
        if value.is_null() {
            null_count += 1;
            continue;
        }
        if distinct.len() < DISTINCT_CAP {
            distinct.insert(value.to_json().to_string());
        }
        if let Some(s) = value.as_str() {
            len_sum += s.chars().count();
            len_count += 1;
        }
        min = Some(match min.take() {
            None => value.clone(),
            Some(current) => {
                if compare_values(&value, &current).is_lt() {
                    value.clone()
                } else {
                    current
                }
            }
        });
        max = Some(match max.take() {
            None => value,
            Some(current) => {
                if compare_values(&value, &current).is_gt() {
                    value
                } else {
                    current
                }
            }
        });
    }

    ColumnStats {
        total_count,
        null_count,
        approx_distinct: distinct.len(),
        min: min.map(|v| v.to_json()),
        max: max.map(|v| v.to_json()),
        avg_len: if len_count > 0 {
            Some(len_sum as f64 / len_count as f64)
        } else {
            None
        },
    }
}
