//! Paragraph and sentence splitters, emitting span lists.

use async_trait::async_trait;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::SiftError;
use crate::schema::{Field, Value};
use crate::signals::{Signal, SignalDescriptor, SignalInput};

pub const PARAGRAPHS: &str = "paragraphs";
pub const SENTENCES: &str = "sentences";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitKind {
    Paragraphs,
    Sentences,
}

/// Splits documents into paragraph or sentence spans.
pub struct SplitterSignal {
    kind: SplitKind,
}

impl SplitterSignal {
    pub fn paragraphs() -> Self {
        Self {
            kind: SplitKind::Paragraphs,
        }
    }

    pub fn sentences() -> Self {
        Self {
            kind: SplitKind::Sentences,
        }
    }

    fn split(&self, text: &str) -> Vec<Value> {
        match self.kind {
            SplitKind::Paragraphs => paragraph_spans(text),
            SplitKind::Sentences => text
                .split_sentence_bound_indices()
                .filter(|(_, s)| !s.trim().is_empty())
                .map(|(offset, s)| Value::span(offset as u32, (offset + s.len()) as u32))
                .collect(),
        }
    }
}

/// Blank-line-delimited paragraphs, excluding the delimiters.
fn paragraph_spans(text: &str) -> Vec<Value> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let is_blank = line.trim().is_empty();
        match (is_blank, start) {
            (false, None) => start = Some(offset),
            (true, Some(s)) => {
                spans.push(Value::span(s as u32, offset as u32));
                start = None;
            }
            _ => {}
        }
        offset += line.len();
    }
    if let Some(s) = start {
        spans.push(Value::span(s as u32, text.len() as u32));
    }
    spans
}

#[async_trait]
impl Signal for SplitterSignal {
    fn descriptor(&self) -> SignalDescriptor {
        let name = match self.kind {
            SplitKind::Paragraphs => PARAGRAPHS,
            SplitKind::Sentences => SENTENCES,
        };
        SignalDescriptor::new(name, serde_json::Value::Null)
    }

    fn output_schema(&self) -> Field {
        Field::repeated(Field::span())
    }

    async fn compute(&self, inputs: &[SignalInput]) -> Result<Vec<Option<Value>>, SiftError> {
        inputs
            .iter()
            .map(|input| {
                let text = input.as_text()?;
                Ok(Some(Value::List(self.split(text))))
            })
            .collect()
    }
}
