//! Keyword search as a signal: case-insensitive substring matches
//! emitted as spans, one per non-overlapping occurrence.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::SiftError;
use crate::schema::{Field, Value};
use crate::signals::{Signal, SignalDescriptor, SignalInput};

pub const NAME: &str = "substring_search";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstringParams {
    pub query: String,
}

pub struct SubstringSignal {
    params: SubstringParams,
    matcher: Regex,
}

impl SubstringSignal {
    /// The query is escaped before compilation, so it is always a literal
    /// substring match regardless of regex metacharacters.
    pub fn new(params: SubstringParams) -> Result<Self, SiftError> {
        let pattern = format!("(?i){}", regex::escape(&params.query));
        let matcher = Regex::new(&pattern)
            .map_err(|e| SiftError::Validation(format!("bad keyword query: {e}")))?;
        Ok(Self { params, matcher })
    }
}

#[async_trait]
impl Signal for SubstringSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new(
            NAME,
            serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null),
        )
    }

    fn output_schema(&self) -> Field {
        Field::repeated(Field::span())
    }

    async fn compute(&self, inputs: &[SignalInput]) -> Result<Vec<Option<Value>>, SiftError> {
        inputs
            .iter()
            .map(|input| {
                let text = input.as_text()?;
                let spans: Vec<Value> = self
                    .matcher
                    .find_iter(text)
                    .map(|m| Value::span(m.start() as u32, m.end() as u32))
                    .collect();
                Ok(Some(Value::List(spans)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn matches(query: &str, text: &str) -> Vec<(u32, u32)> {
        let signal = SubstringSignal::new(SubstringParams {
            query: query.to_string(),
        })
        .unwrap();
        let out = signal
            .compute(&[SignalInput::Text(text.to_string())])
            .await
            .unwrap();
        let Some(Value::List(items)) = &out[0] else {
            panic!("expected list");
        };
        items
            .iter()
            .map(|v| {
                let Value::Span { start, end } = v else {
                    panic!("expected span");
                };
                (*start, *end)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_case_insensitive_non_overlapping() {
        let got = matches("ab", "ab AB xab").await;
        assert_eq!(got, vec![(0, 2), (3, 5), (7, 9)]);
    }

    #[tokio::test]
    async fn test_metacharacters_are_literal() {
        let got = matches("a.b", "a.b axb").await;
        assert_eq!(got, vec![(0, 3)]);
    }

    #[tokio::test]
    async fn test_no_match_is_empty_list() {
        assert!(matches("zzz", "nothing here").await.is_empty());
    }
}
