//! Per-document language detection.

use async_trait::async_trait;

use crate::error::SiftError;
use crate::schema::{Field, Value};
use crate::signals::{Signal, SignalDescriptor, SignalInput};

pub const NAME: &str = "lang_detection";

/// Detects the dominant language of each document, emitting an ISO 639-3
/// code (e.g. "eng"). Undetectable inputs yield null.
#[derive(Debug, Default)]
pub struct LangDetectionSignal;

#[async_trait]
impl Signal for LangDetectionSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new(NAME, serde_json::Value::Null)
    }

    fn output_schema(&self) -> Field {
        Field::string()
    }

    async fn compute(&self, inputs: &[SignalInput]) -> Result<Vec<Option<Value>>, SiftError> {
        inputs
            .iter()
            .map(|input| {
                let text = input.as_text()?;
                Ok(whatlang::detect(text)
                    .map(|info| Value::string(info.lang().code())))
            })
            .collect()
    }
}
