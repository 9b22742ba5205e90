//! PII detection: emails, phone numbers, IP addresses, secret-looking
//! tokens, emitted as spans with a kind label.

use std::collections::BTreeMap;

use async_trait::async_trait;
use regex::Regex;

use crate::error::SiftError;
use crate::schema::{Field, Value};
use crate::signals::{Signal, SignalDescriptor, SignalInput};

pub const NAME: &str = "pii";

const KIND_EMAIL: &str = "email";
const KIND_PHONE: &str = "phone";
const KIND_IP: &str = "ip";
const KIND_SECRET: &str = "secret";

pub struct PiiSignal {
    matchers: Vec<(&'static str, Regex)>,
}

impl Default for PiiSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl PiiSignal {
    pub fn new() -> Self {
        // Compiled once per resolved signal; kind order decides precedence
        // when matches overlap.
        let matchers = vec![
            (
                KIND_EMAIL,
                Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
                    .expect("email regex is valid"),
            ),
            (
                KIND_IP,
                Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ip regex is valid"),
            ),
            (
                KIND_PHONE,
                Regex::new(r"\+?\d{1,2}[-. ]?\(?\d{3}\)?[-. ]\d{3}[-. ]\d{4}|\b\d{3}[-. ]\d{4}\b")
                    .expect("phone regex is valid"),
            ),
            (
                KIND_SECRET,
                Regex::new(r"\b[A-Fa-f0-9]{32,}\b|\b[A-Za-z0-9+/]{40,}={0,2}")
                    .expect("secret regex is valid"),
            ),
        ];
        Self { matchers }
    }

    fn detect(&self, text: &str) -> Vec<Value> {
        let mut found: Vec<(u32, u32, &'static str)> = Vec::new();
        for (kind, regex) in &self.matchers {
            for m in regex.find_iter(text) {
                let (start, end) = (m.start() as u32, m.end() as u32);
                // Earlier kinds win overlapping ranges.
                if found.iter().any(|(s, e, _)| start < *e && *s < end) {
                    continue;
                }
                found.push((start, end, kind));
            }
        }
        found.sort_by_key(|(start, end, _)| (*start, *end));
        found
            .into_iter()
            .map(|(start, end, kind)| {
                Value::Struct(BTreeMap::from([
                    ("span".to_string(), Value::span(start, end)),
                    ("kind".to_string(), Value::string(kind)),
                ]))
            })
            .collect()
    }
}

#[async_trait]
impl Signal for PiiSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new(NAME, serde_json::Value::Null)
    }

    fn output_schema(&self) -> Field {
        Field::repeated(Field::struct_of([
            ("span", Field::span()),
            ("kind", Field::string()),
        ]))
    }

    async fn compute(&self, inputs: &[SignalInput]) -> Result<Vec<Option<Value>>, SiftError> {
        inputs
            .iter()
            .map(|input| {
                let text = input.as_text()?;
                Ok(Some(Value::List(self.detect(text))))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds_and_spans(value: &Option<Value>) -> Vec<(String, u32, u32)> {
        let Some(Value::List(items)) = value else {
            panic!("expected list output");
        };
        items
            .iter()
            .map(|item| {
                let Value::Struct(map) = item else {
                    panic!("expected struct item");
                };
                let Value::Span { start, end } = map["span"] else {
                    panic!("expected span");
                };
                (map["kind"].as_str().unwrap().to_string(), start, end)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_email_and_phone_spans() {
        let signal = PiiSignal::new();
        let text = "Contact me at alice@x.com or 555-1212.";
        let out = signal
            .compute(&[SignalInput::Text(text.to_string())])
            .await
            .unwrap();
        let found = kinds_and_spans(&out[0]);
        assert_eq!(
            found,
            vec![
                ("email".to_string(), 14, 25),
                ("phone".to_string(), 29, 37),
            ]
        );
        assert_eq!(&text[14..25], "alice@x.com");
        assert_eq!(&text[29..37], "555-1212");
    }

    #[tokio::test]
    async fn test_ip_detection() {
        let signal = PiiSignal::new();
        let out = signal
            .compute(&[SignalInput::Text("server at 10.0.0.1 responded".to_string())])
            .await
            .unwrap();
        let found = kinds_and_spans(&out[0]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "ip");
    }

    #[tokio::test]
    async fn test_secret_detection() {
        let signal = PiiSignal::new();
        let out = signal
            .compute(&[SignalInput::Text(
                "token deadbeefdeadbeefdeadbeefdeadbeef1234 leaked".to_string(),
            )])
            .await
            .unwrap();
        let found = kinds_and_spans(&out[0]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "secret");
    }

    #[tokio::test]
    async fn test_clean_text_yields_empty_list() {
        let signal = PiiSignal::new();
        let out = signal
            .compute(&[SignalInput::Text("nothing sensitive here".to_string())])
            .await
            .unwrap();
        assert_eq!(out[0], Some(Value::List(vec![])));
    }
}
