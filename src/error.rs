//! Error types for ewc-continual-rs.
//!
//! Every fallible operation in the crate returns [`Result`], whose error type is
//! [`ContinualError`]. The two variants callers most often match on are
//! [`ContinualError::EmptyDataset`] and [`ContinualError::ShapeMismatch`]; both are fatal
//! to the call that raised them and are never retried.
//!
//! # Example
//!
//! ```rust
//! use ewc_continual_rs::{ContinualError, Result};
//!
//! fn require_batches(count: usize) -> Result<()> {
//!     if count == 0 {
//!         return Err(ContinualError::EmptyDataset("no batches".to_string()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(matches!(require_batches(0), Err(ContinualError::EmptyDataset(_))));
//! assert!(require_batches(3).is_ok());
//! ```

use thiserror::Error;

/// Result type alias for ewc-continual-rs operations.
pub type Result<T> = std::result::Result<T, ContinualError>;

/// Errors that can occur in ewc-continual-rs.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ContinualError {
    /// Zero batches were available where at least one is required.
    #[error("empty dataset: {0}")]
    EmptyDataset(String),

    /// A gradient or snapshot does not match the parameter's declared shape.
    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Parameter name.
        name: String,
        /// Shape the parameter was declared with.
        expected: Vec<usize>,
        /// Shape that was observed.
        actual: Vec<usize>,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Dataset error.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// Training error.
    #[error("training error: {0}")]
    Training(String),

    /// Checkpoint error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),
}

impl From<indicatif::style::TemplateError> for ContinualError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        ContinualError::Template(err.to_string())
    }
}

impl ContinualError {
    /// Build a [`ContinualError::ShapeMismatch`] from two dimension slices.
    pub fn shape_mismatch(name: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        ContinualError::ShapeMismatch {
            name: name.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
