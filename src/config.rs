//! Configuration parsing and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ContinualError, Result};
use crate::optimizer::OptimizerConfig;

/// Main configuration for a continual-learning run.
///
/// # Example
///
/// ```rust
/// use ewc_continual_rs::ContinualConfig;
///
/// # fn main() -> ewc_continual_rs::Result<()> {
/// let mut config = ContinualConfig::from_preset("moderation")?;
/// config.ewc.lambda = 1.0;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinualConfig {
    /// Classifier settings.
    #[serde(default)]
    pub model: ModelSettings,

    /// Tokenization and label settings.
    pub dataset: DatasetConfig,

    /// Training hyperparameters.
    #[serde(default)]
    pub training: TrainingConfig,

    /// EWC settings.
    #[serde(default)]
    pub ewc: EwcSettings,

    /// Tasks, trained in order.
    pub tasks: Vec<TaskConfig>,

    /// Output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    42
}

/// Reference classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Embedding width.
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Dropout probability applied to the pooled representation in training mode.
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    /// Keep the embedding table fixed; only the classification head trains.
    #[serde(default)]
    pub freeze_embeddings: bool,
}

fn default_hidden_size() -> usize {
    64
}
fn default_dropout() -> f32 {
    0.1
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            dropout: default_dropout(),
            freeze_embeddings: false,
        }
    }
}

/// Dataset configuration shared by all tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Path to a `tokenizer.json` file.
    pub tokenizer_path: String,

    /// Maximum sequence length; longer inputs are truncated, shorter ones padded.
    #[serde(default = "default_max_length")]
    pub max_length: usize,

    /// Label names, indexed by class id.
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
}

fn default_max_length() -> usize {
    128
}
fn default_labels() -> Vec<String> {
    vec!["NEUTRAL".into(), "ABUSE".into(), "HATE".into()]
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            tokenizer_path: String::new(),
            max_length: default_max_length(),
            labels: default_labels(),
        }
    }
}

/// Optimizer selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// AdamW.
    #[default]
    AdamW,
    /// Stochastic gradient descent.
    Sgd,
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs per task.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Weight decay (AdamW only).
    #[serde(default)]
    pub weight_decay: f64,

    /// Optimizer.
    #[serde(default)]
    pub optimizer: OptimizerKind,

    /// Log every N batches.
    #[serde(default = "default_log_steps")]
    pub logging_steps: usize,

    /// Draw progress bars.
    #[serde(default)]
    pub progress: bool,
}

fn default_epochs() -> usize {
    2
}
fn default_batch_size() -> usize {
    16
}
fn default_lr() -> f64 {
    2e-5
}
fn default_log_steps() -> usize {
    10
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_lr(),
            weight_decay: 0.0,
            optimizer: OptimizerKind::AdamW,
            logging_steps: default_log_steps(),
            progress: false,
        }
    }
}

impl TrainingConfig {
    /// Optimizer configuration derived from these hyperparameters.
    pub fn optimizer_config(&self) -> OptimizerConfig {
        OptimizerConfig {
            kind: self.optimizer,
            learning_rate: self.learning_rate,
            weight_decay: self.weight_decay,
            ..OptimizerConfig::default()
        }
    }
}

/// EWC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EwcSettings {
    /// Consolidate each finished task before training the next.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Penalty strength; the loss adds `lambda / 2 * penalty`.
    #[serde(default = "default_lambda")]
    pub lambda: f64,

    /// Maximum number of batches for Fisher estimation; all batches when unset.
    #[serde(default)]
    pub sample_limit: Option<usize>,
}

fn default_true() -> bool {
    true
}
fn default_lambda() -> f64 {
    0.4
}

impl Default for EwcSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            lambda: default_lambda(),
            sample_limit: None,
        }
    }
}

/// One task of the sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Display name used in logs and checkpoints.
    pub name: String,
    /// JSONL file with `text` and `label` fields.
    pub path: String,
}

impl ContinualConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"moderation"` - three-label moderation classifier over two tasks
    /// - `"tiny"` - small, fast settings for smoke runs
    ///
    /// # Errors
    ///
    /// Returns an error for unknown presets.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "moderation" => Ok(Self::moderation_preset()),
            "tiny" => Ok(Self::tiny_preset()),
            _ => Err(ContinualError::Config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Three-label moderation classifier trained on two sequential tasks.
    #[must_use]
    pub fn moderation_preset() -> Self {
        Self {
            model: ModelSettings::default(),
            dataset: DatasetConfig {
                tokenizer_path: "./data/tokenizer.json".into(),
                ..Default::default()
            },
            training: TrainingConfig::default(),
            ewc: EwcSettings::default(),
            tasks: vec![
                TaskConfig {
                    name: "task-a".into(),
                    path: "./data/task_a.jsonl".into(),
                },
                TaskConfig {
                    name: "task-b".into(),
                    path: "./data/task_b.jsonl".into(),
                },
            ],
            output_dir: "./outputs/moderation".into(),
            seed: 42,
        }
    }

    /// Small model, few epochs, SGD.
    #[must_use]
    pub fn tiny_preset() -> Self {
        Self {
            model: ModelSettings {
                hidden_size: 8,
                dropout: 0.0,
                freeze_embeddings: false,
            },
            dataset: DatasetConfig {
                tokenizer_path: "./data/tokenizer.json".into(),
                max_length: 16,
                ..Default::default()
            },
            training: TrainingConfig {
                epochs: 1,
                batch_size: 4,
                learning_rate: 0.1,
                optimizer: OptimizerKind::Sgd,
                logging_steps: 1,
                ..Default::default()
            },
            ewc: EwcSettings {
                sample_limit: Some(8),
                ..Default::default()
            },
            tasks: vec![
                TaskConfig {
                    name: "task-a".into(),
                    path: "./data/task_a.jsonl".into(),
                },
                TaskConfig {
                    name: "task-b".into(),
                    path: "./data/task_b.jsonl".into(),
                },
            ],
            output_dir: "./outputs/tiny".into(),
            seed: 42,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.dataset.tokenizer_path.is_empty() {
            return Err(ContinualError::Config(
                "dataset.tokenizer_path is required".into(),
            ));
        }
        if self.dataset.max_length == 0 {
            return Err(ContinualError::Config("dataset.max_length must be > 0".into()));
        }
        if self.dataset.labels.len() < 2 {
            return Err(ContinualError::Config(
                "dataset.labels needs at least two labels".into(),
            ));
        }
        if self.model.hidden_size == 0 {
            return Err(ContinualError::Config("model.hidden_size must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(ContinualError::Config(
                "model.dropout must be in [0, 1)".into(),
            ));
        }
        if self.training.epochs == 0 {
            return Err(ContinualError::Config("training.epochs must be > 0".into()));
        }
        if self.training.batch_size == 0 {
            return Err(ContinualError::Config(
                "training.batch_size must be > 0".into(),
            ));
        }
        if self.training.logging_steps == 0 {
            return Err(ContinualError::Config(
                "training.logging_steps must be > 0".into(),
            ));
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(ContinualError::Config(
                "training.learning_rate must be > 0".into(),
            ));
        }
        if !(self.ewc.lambda >= 0.0) {
            return Err(ContinualError::Config("ewc.lambda must be >= 0".into()));
        }
        if self.ewc.sample_limit == Some(0) {
            return Err(ContinualError::Config(
                "ewc.sample_limit must be > 0 when set".into(),
            ));
        }
        if self.tasks.is_empty() {
            return Err(ContinualError::Config("at least one task is required".into()));
        }
        for task in &self.tasks {
            if task.name.is_empty() || task.path.is_empty() {
                return Err(ContinualError::Config(
                    "every task needs a name and a path".into(),
                ));
            }
        }
        Ok(())
    }
}
