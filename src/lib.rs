//! # ewc-continual-rs
//!
//! Continual fine-tuning of classifiers with Elastic Weight Consolidation (EWC).
//!
//! After a task is learned, EWC records a snapshot of the trainable parameters and a
//! diagonal Fisher estimate of how much each parameter mattered for that task. While the
//! next task trains, a quadratic penalty pulls important parameters back toward their
//! snapshot, which limits catastrophic forgetting.
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starter configuration
//! ewc-train init config.yaml --preset moderation
//!
//! # Validate it, then train every task in order
//! ewc-train validate config.yaml
//! ewc-train train config.yaml
//!
//! # Look at a saved consolidation checkpoint
//! ewc-train inspect ./outputs/task-1-hate-speech/ewc.safetensors
//! ```
//!
//! ## Quick Start (Library)
//!
//! Any type implementing [`Model`] can be trained; any [`DataLoader`] can feed it.
//!
//! ```no_run
//! use candle_core::Device;
//! use ewc_continual_rs::config::ModelSettings;
//! use ewc_continual_rs::data::Batch;
//! use ewc_continual_rs::optimizer::OptimizerConfig;
//! use ewc_continual_rs::{train_task, Ewc, ModerationClassifier, TaskOptions};
//!
//! # fn main() -> ewc_continual_rs::Result<()> {
//! # let (first, second): (Vec<Batch>, Vec<Batch>) = (Vec::new(), Vec::new());
//! let mut model = ModerationClassifier::new(&ModelSettings::default(), 30_000, 3, &Device::Cpu)?;
//! let mut optimizer = OptimizerConfig::default().build_for(&model)?;
//!
//! train_task(&mut model, &first, &mut optimizer, None, TaskOptions::default())
//!     .average_losses()?;
//!
//! let ewc = Ewc::new(&mut model, &first, Some(200))?;
//! let losses = train_task(&mut model, &second, &mut optimizer, Some(&ewc), TaskOptions::default())
//!     .average_losses()?;
//! println!("{losses:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Config-driven runs
//!
//! ```no_run
//! use ewc_continual_rs::{ContinualConfig, ContinualTrainer};
//!
//! # fn main() -> ewc_continual_rs::Result<()> {
//! let config = ContinualConfig::from_file("config.yaml")?;
//! ContinualTrainer::new(config)?.run()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod classifier;
pub mod config;
pub mod data;
pub mod dataset;
pub mod error;
pub mod ewc;
pub mod fisher;
pub mod model;
pub mod optimizer;
pub mod snapshot;
pub mod trainer;

pub use classifier::ModerationClassifier;
pub use config::{ContinualConfig, TrainingConfig};
pub use data::{Batch, DataLoader, TensorDataLoader};
pub use error::{ContinualError, Result};
pub use ewc::Ewc;
pub use fisher::FisherWeights;
pub use model::{Model, ModelOutput, NamedParameter};
pub use snapshot::ParameterSnapshot;
pub use trainer::{
    evaluate, train_task, ContinualTrainer, EpochReport, Evaluation, TaskOptions, TaskReport,
    TaskRun,
};
