//! Moderation dataset loading and tokenization.
//!
//! Each task is a JSONL file with one `{"text": "...", "label": ...}` object per line. The
//! label is either a configured label name (`"HATE"`) or a class index (`2`).

use std::path::Path;

use candle_core::Device;
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::data::TensorDataLoader;
use crate::error::{ContinualError, Result};

/// A single labelled text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    /// Raw text.
    pub text: String,
    /// Class index into the configured label list.
    pub label: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawLabel {
    Index(u32),
    Name(String),
}

#[derive(Deserialize)]
struct RawExample {
    text: String,
    label: RawLabel,
}

/// Examples of one task.
#[derive(Debug, Clone)]
pub struct ModerationDataset {
    /// Examples in file order.
    pub examples: Vec<Example>,
}

impl ModerationDataset {
    /// Load a JSONL file, resolving label names against `labels`.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Dataset`] if the file is missing, a line is malformed or a
    /// label is unknown.
    pub fn load<P: AsRef<Path>>(path: P, labels: &[String]) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ContinualError::Dataset(format!(
                "Dataset not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let mut examples = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let raw: RawExample = serde_json::from_str(line).map_err(|e| {
                ContinualError::Dataset(format!("Failed to parse line {}: {e}", line_no + 1))
            })?;
            let label = resolve_label(&raw.label, labels).ok_or_else(|| {
                ContinualError::Dataset(format!("Unknown label on line {}", line_no + 1))
            })?;
            examples.push(Example {
                text: raw.text,
                label,
            });
        }

        tracing::info!("Loaded {} examples from {}", examples.len(), path.display());
        Ok(Self { examples })
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Tokenize every example to exactly `max_length` tokens and wrap the result in a loader.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization or tensor creation fails.
    pub fn into_loader(
        &self,
        tokenizer: &Tokenizer,
        max_length: usize,
        batch_size: usize,
        device: &Device,
    ) -> Result<TensorDataLoader> {
        let pad_token_id = tokenizer
            .token_to_id("<pad>")
            .or_else(|| tokenizer.token_to_id("[PAD]"))
            .unwrap_or(0);

        let mut ids = Vec::with_capacity(self.len() * max_length);
        let mut mask = Vec::with_capacity(self.len() * max_length);
        let mut labels = Vec::with_capacity(self.len());

        for example in &self.examples {
            let encoding = tokenizer.encode(example.text.as_str(), true)?;
            let mut row = encoding.get_ids().to_vec();
            row.truncate(max_length);
            let real = row.len();
            row.resize(max_length, pad_token_id);

            ids.extend_from_slice(&row);
            mask.extend((0..max_length).map(|i| u32::from(i < real)));
            labels.push(example.label);
        }

        TensorDataLoader::from_rows(ids, mask, labels, max_length, batch_size, device)
    }
}

fn resolve_label(raw: &RawLabel, labels: &[String]) -> Option<u32> {
    match raw {
        RawLabel::Index(i) => ((*i as usize) < labels.len()).then_some(*i),
        RawLabel::Name(name) => labels
            .iter()
            .position(|l| l.eq_ignore_ascii_case(name))
            .and_then(|i| u32::try_from(i).ok()),
    }
}

/// Load a `tokenizer.json` file.
///
/// # Errors
///
/// Returns [`ContinualError::Tokenizer`] if the file cannot be parsed.
pub fn load_tokenizer<P: AsRef<Path>>(path: P) -> Result<Tokenizer> {
    Ok(Tokenizer::from_file(path)?)
}
