//! Text statistics: length, word/sentence counts, readability.

use std::collections::BTreeMap;
use std::collections::HashSet;

use async_trait::async_trait;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::SiftError;
use crate::schema::{DType, Field, Scalar, Value};
use crate::signals::{Signal, SignalDescriptor, SignalInput};

pub const NAME: &str = "text_statistics";

/// Per-document statistics over the raw text.
#[derive(Debug, Default)]
pub struct TextStatisticsSignal;

#[async_trait]
impl Signal for TextStatisticsSignal {
    fn descriptor(&self) -> SignalDescriptor {
        SignalDescriptor::new(NAME, serde_json::Value::Null)
    }

    fn output_schema(&self) -> Field {
        Field::struct_of([
            ("num_characters", Field::of(DType::UInt32)),
            ("num_words", Field::of(DType::UInt32)),
            ("num_sentences", Field::of(DType::UInt32)),
            ("frac_non_ascii", Field::of(DType::Float32)),
            ("type_token_ratio", Field::of(DType::Float32)),
            ("readability", Field::of(DType::Float32)),
        ])
    }

    async fn compute(&self, inputs: &[SignalInput]) -> Result<Vec<Option<Value>>, SiftError> {
        inputs
            .iter()
            .map(|input| {
                let text = input.as_text()?;
                Ok(Some(statistics(text)))
            })
            .collect()
    }
}

fn statistics(text: &str) -> Value {
    let num_characters = text.chars().count();
    let words: Vec<&str> = text.unicode_words().collect();
    let num_words = words.len();
    let num_sentences = text
        .unicode_sentences()
        .filter(|s| !s.trim().is_empty())
        .count();

    let non_ascii = text.chars().filter(|c| !c.is_ascii()).count();
    let frac_non_ascii = if num_characters > 0 {
        non_ascii as f64 / num_characters as f64
    } else {
        0.0
    };

    let distinct: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();
    let type_token_ratio = if num_words > 0 {
        distinct.len() as f64 / num_words as f64
    } else {
        0.0
    };

    Value::Struct(BTreeMap::from([
        (
            "num_characters".to_string(),
            Value::Scalar(Scalar::UInt(num_characters as u64)),
        ),
        (
            "num_words".to_string(),
            Value::Scalar(Scalar::UInt(num_words as u64)),
        ),
        (
            "num_sentences".to_string(),
            Value::Scalar(Scalar::UInt(num_sentences as u64)),
        ),
        ("frac_non_ascii".to_string(), Value::float(frac_non_ascii)),
        (
            "type_token_ratio".to_string(),
            Value::float(type_token_ratio),
        ),
        (
            "readability".to_string(),
            Value::float(flesch_reading_ease(&words, num_sentences)),
        ),
    ]))
}

/// Flesch reading ease with an orthographic syllable estimate. Higher is
/// easier; ~100 for short common words, negative for dense prose.
fn flesch_reading_ease(words: &[&str], num_sentences: usize) -> f64 {
    if words.is_empty() || num_sentences == 0 {
        return 0.0;
    }
    let syllables: usize = words.iter().map(|w| estimate_syllables(w)).sum();
    let words_per_sentence = words.len() as f64 / num_sentences as f64;
    let syllables_per_word = syllables as f64 / words.len() as f64;
    206.835 - 1.015 * words_per_sentence - 84.6 * syllables_per_word
}

fn estimate_syllables(word: &str) -> usize {
    let lowered = word.to_lowercase();
    let mut count = 0;
    let mut prev_vowel = false;
    for c in lowered.chars() {
        let vowel = matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');
        if vowel && !prev_vowel {
            count += 1;
        }
        prev_vowel = vowel;
    }
    // Silent trailing 'e'.
    if lowered.ends_with('e') && count > 1 {
        count -= 1;
    }
    count.max(1)
}
