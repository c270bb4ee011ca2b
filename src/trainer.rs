//! Continual training loop.
//!
//! [`train_task`] trains one task and yields one [`EpochReport`] per epoch, lazily: each call
//! to `next()` runs a full pass over the loader. Dropping the iterator between epochs stops
//! training. [`ContinualTrainer`] drives a whole configured task sequence, consolidating each
//! finished task with EWC before training the next.

use std::iter::FusedIterator;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::Optimizer;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::classifier::ModerationClassifier;
use crate::config::ContinualConfig;
use crate::data::{DataLoader, TensorDataLoader};
use crate::dataset::{load_tokenizer, ModerationDataset};
use crate::error::{ContinualError, Result};
use crate::ewc::Ewc;
use crate::model::Model;

/// Per-task options for [`train_task`].
#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Name used in logs and reports.
    pub task_name: String,
    /// Number of passes over the loader.
    pub epochs: usize,
    /// EWC strength; the loss adds `ewc_lambda / 2 * penalty`.
    pub ewc_lambda: f64,
    /// Emit a debug log line every N batches.
    pub logging_steps: usize,
    /// Draw a spinner per epoch.
    pub progress: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            task_name: "Task".into(),
            epochs: 2,
            ewc_lambda: 0.4,
            logging_steps: 10,
            progress: false,
        }
    }
}

/// Diagnostics for one finished epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// Task name.
    pub task: String,
    /// 1-based epoch index.
    pub epoch: usize,
    /// Mean of the per-batch total loss (task loss plus weighted penalty).
    pub average_loss: f64,
    /// Mean of the per-batch task loss alone.
    pub average_task_loss: f64,
    /// Mean of the per-batch unscaled EWC penalty (zero without EWC).
    pub average_penalty: f64,
    /// Batches processed.
    pub batches: usize,
}

/// Train `model` on one task.
///
/// The model is switched to training mode immediately and stays there. Nothing runs until
/// the returned iterator is polled; each item is one epoch. After an error the iterator is
/// exhausted.
///
/// # Example
///
/// ```no_run
/// use candle_core::Device;
/// use ewc_continual_rs::{train_task, Ewc, ModerationClassifier, Model, TaskOptions};
/// use ewc_continual_rs::config::ModelSettings;
/// use ewc_continual_rs::data::Batch;
/// use ewc_continual_rs::optimizer::OptimizerConfig;
///
/// # fn main() -> ewc_continual_rs::Result<()> {
/// # let (task_a, task_b): (Vec<Batch>, Vec<Batch>) = (Vec::new(), Vec::new());
/// let mut model = ModerationClassifier::new(&ModelSettings::default(), 1000, 3, &Device::Cpu)?;
/// let mut optimizer = OptimizerConfig::default().build_for(&model)?;
///
/// let options = TaskOptions { task_name: "task-a".into(), ..TaskOptions::default() };
/// train_task(&mut model, &task_a, &mut optimizer, None, options).average_losses()?;
///
/// let ewc = Ewc::new(&mut model, &task_a, Some(200))?;
/// let options = TaskOptions { task_name: "task-b".into(), ..TaskOptions::default() };
/// for epoch in train_task(&mut model, &task_b, &mut optimizer, Some(&ewc), options) {
///     println!("{:.4}", epoch?.average_loss);
/// }
/// # Ok(())
/// # }
/// ```
pub fn train_task<'a, M, D, O>(
    model: &'a mut M,
    data: &'a D,
    optimizer: &'a mut O,
    ewc: Option<&'a Ewc>,
    options: TaskOptions,
) -> TaskRun<'a, M, D, O>
where
    M: Model + ?Sized,
    D: DataLoader + ?Sized,
    O: Optimizer,
{
    model.set_training(true);
    TaskRun {
        model,
        data,
        optimizer,
        ewc,
        options,
        epoch: 0,
        done: false,
    }
}

/// Lazy epoch sequence returned by [`train_task`].
pub struct TaskRun<'a, M: ?Sized, D: ?Sized, O> {
    model: &'a mut M,
    data: &'a D,
    optimizer: &'a mut O,
    ewc: Option<&'a Ewc>,
    options: TaskOptions,
    epoch: usize,
    done: bool,
}

impl<M, D, O> TaskRun<'_, M, D, O>
where
    M: Model + ?Sized,
    D: DataLoader + ?Sized,
    O: Optimizer,
{
    /// Run all remaining epochs and collect their average losses.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by an epoch.
    pub fn average_losses(self) -> Result<Vec<f64>> {
        self.map(|report| report.map(|r| r.average_loss)).collect()
    }

    fn run_epoch(&mut self) -> Result<EpochReport> {
        let device = self.model.device().clone();
        let half_lambda = self.options.ewc_lambda / 2.0;
        let progress = self.spinner()?;

        let mut running_loss = 0.0;
        let mut running_task_loss = 0.0;
        let mut running_penalty = 0.0;
        let mut batches = 0usize;

        for batch in self.data.batches() {
            let batch = batch?.to_device(&device)?;
            let output = self.model.forward(&batch)?;
            let task_loss = output.loss;

            let (final_loss, penalty_value) = match self.ewc {
                Some(ewc) => {
                    let penalty = ewc.penalty(&*self.model)?;
                    let penalty_value = scalar_value(&penalty)?;
                    let weighted = penalty.affine(half_lambda, 0.0)?.to_dtype(task_loss.dtype())?;
                    (task_loss.broadcast_add(&weighted)?, penalty_value)
                }
                None => (task_loss.clone(), 0.0),
            };

            let grads = final_loss.backward()?;
            self.optimizer.step(&grads)?;

            let loss_value = scalar_value(&final_loss)?;
            running_loss += loss_value;
            running_task_loss += scalar_value(&task_loss)?;
            running_penalty += penalty_value;
            batches += 1;

            if batches % self.options.logging_steps.max(1) == 0 {
                tracing::debug!(
                    "[{}] Epoch {}, batch {}: loss {:.4}, penalty {:.6}",
                    self.options.task_name,
                    self.epoch,
                    batches,
                    loss_value,
                    penalty_value
                );
            }
            if let Some(pb) = &progress {
                pb.set_message(format!("loss {loss_value:.4}"));
                pb.inc(1);
            }
        }

        if batches == 0 {
            return Err(ContinualError::EmptyDataset(format!(
                "task `{}` epoch {} yielded no batches",
                self.options.task_name, self.epoch
            )));
        }

        let n = batches as f64;
        let report = EpochReport {
            task: self.options.task_name.clone(),
            epoch: self.epoch,
            average_loss: running_loss / n,
            average_task_loss: running_task_loss / n,
            average_penalty: running_penalty / n,
            batches,
        };
        if let Some(pb) = progress {
            pb.finish_with_message(format!("loss {:.4}", report.average_loss));
        }
        tracing::info!(
            "[{}] Epoch {}/{} - Loss: {:.4}",
            report.task,
            report.epoch,
            self.options.epochs,
            report.average_loss
        );
        Ok(report)
    }

    fn spinner(&self) -> Result<Option<ProgressBar>> {
        if !self.options.progress {
            return Ok(None);
        }
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {prefix} {pos} batches {msg}")?,
        );
        pb.set_prefix(format!(
            "{} {}/{}",
            self.options.task_name, self.epoch, self.options.epochs
        ));
        Ok(Some(pb))
    }
}

impl<M, D, O> Iterator for TaskRun<'_, M, D, O>
where
    M: Model + ?Sized,
    D: DataLoader + ?Sized,
    O: Optimizer,
{
    type Item = Result<EpochReport>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.epoch >= self.options.epochs {
            return None;
        }
        self.epoch += 1;
        let report = self.run_epoch();
        if report.is_err() {
            self.done = true;
        }
        Some(report)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        (0, Some(self.options.epochs - self.epoch))
    }
}

impl<M, D, O> FusedIterator for TaskRun<'_, M, D, O>
where
    M: Model + ?Sized,
    D: DataLoader + ?Sized,
    O: Optimizer,
{
}

/// Loss and accuracy of a model on one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Task name.
    pub task: String,
    /// Mean task loss per batch.
    pub loss: f64,
    /// Fraction of correctly classified examples.
    pub accuracy: f64,
    /// Examples seen.
    pub examples: usize,
}

/// Evaluate `model` in eval mode, restoring its previous mode afterwards.
///
/// # Errors
///
/// Returns [`ContinualError::EmptyDataset`] if the loader yields no batches, or any forward
/// error.
pub fn evaluate<M, D>(model: &mut M, data: &D, task: &str) -> Result<Evaluation>
where
    M: Model + ?Sized,
    D: DataLoader + ?Sized,
{
    let was_training = model.is_training();
    model.set_training(false);
    let result = evaluate_batches(model, data, task);
    model.set_training(was_training);
    result
}

fn evaluate_batches<M, D>(model: &M, data: &D, task: &str) -> Result<Evaluation>
where
    M: Model + ?Sized,
    D: DataLoader + ?Sized,
{
    let device = model.device().clone();
    let mut loss = 0.0;
    let mut batches = 0usize;
    let mut correct = 0usize;
    let mut examples = 0usize;

    for batch in data.batches() {
        let batch = batch?.to_device(&device)?;
        let output = model.forward(&batch)?;
        loss += scalar_value(&output.loss)?;
        let predicted = output.logits.argmax(candle_core::D::Minus1)?;
        let hits = predicted
            .eq(&batch.labels)?
            .to_dtype(DType::F64)?
            .sum_all()?
            .to_scalar::<f64>()?;
        correct += hits as usize;
        examples += batch.len();
        batches += 1;
    }

    if batches == 0 || examples == 0 {
        return Err(ContinualError::EmptyDataset(format!(
            "evaluation data for `{task}` yielded no examples"
        )));
    }

    Ok(Evaluation {
        task: task.to_string(),
        loss: loss / batches as f64,
        accuracy: correct as f64 / examples as f64,
        examples,
    })
}

/// Value of a (possibly rank-1) scalar tensor as `f64`.
fn scalar_value(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?)
}

/// Outcome of one task of a [`ContinualTrainer`] run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    /// 1-based position in the task sequence.
    pub index: usize,
    /// Task name.
    pub task: String,
    /// Whether an EWC penalty from the previous task was applied.
    pub ewc_applied: bool,
    /// Per-epoch diagnostics.
    pub epochs: Vec<EpochReport>,
    /// Accuracy on this and every earlier task after training.
    pub evaluations: Vec<Evaluation>,
    /// Checkpoint directory.
    pub checkpoint: PathBuf,
}

/// Drives a configured sequence of tasks.
///
/// # Example
///
/// ```no_run
/// use ewc_continual_rs::{ContinualConfig, ContinualTrainer};
///
/// # fn main() -> ewc_continual_rs::Result<()> {
/// let config = ContinualConfig::from_file("config.yaml")?;
/// let trainer = ContinualTrainer::new(config)?;
/// for report in trainer.run()? {
///     println!("{}: {:?}", report.task, report.evaluations);
/// }
/// # Ok(())
/// # }
/// ```
pub struct ContinualTrainer {
    config: ContinualConfig,
    device: Device,
}

impl ContinualTrainer {
    /// Create a trainer, validating the configuration and selecting a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ContinualConfig) -> Result<Self> {
        config.validate()?;
        let device = select_device();
        if device.is_cuda() {
            device.set_seed(config.seed)?;
        }
        Ok(Self { config, device })
    }

    /// Device training runs on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Configuration.
    pub fn config(&self) -> &ContinualConfig {
        &self.config
    }

    /// Train every task in order.
    ///
    /// For each task: train with the EWC penalty of the previous task (when enabled),
    /// evaluate on all tasks seen so far, consolidate the finished task into a new EWC
    /// penalty, and write a checkpoint. A final `report.json` summarises the run.
    ///
    /// # Errors
    ///
    /// Returns the first error from loading, training or checkpointing. Checkpoints of
    /// earlier tasks stay on disk.
    pub fn run(&self) -> Result<Vec<TaskReport>> {
        let config = &self.config;
        tracing::info!("Starting continual training");
        tracing::info!("  Tasks: {}", config.tasks.len());
        tracing::info!("  Epochs per task: {}", config.training.epochs);
        tracing::info!("  EWC: enabled={}, lambda={}", config.ewc.enabled, config.ewc.lambda);

        let tokenizer = load_tokenizer(&config.dataset.tokenizer_path)?;
        let vocab_size = tokenizer.get_vocab_size(true);
        let mut model = ModerationClassifier::new(
            &config.model,
            vocab_size,
            config.dataset.labels.len(),
            &self.device,
        )?;

        std::fs::create_dir_all(&config.output_dir)?;

        let mut seen: Vec<(String, TensorDataLoader)> = Vec::new();
        let mut previous: Option<Ewc> = None;
        let mut reports = Vec::with_capacity(config.tasks.len());

        for (i, task) in config.tasks.iter().enumerate() {
            let dataset = ModerationDataset::load(&task.path, &config.dataset.labels)?;
            let loader = dataset.into_loader(
                &tokenizer,
                config.dataset.max_length,
                config.training.batch_size,
                &self.device,
            )?;

            let ewc = previous.as_ref().filter(|_| config.ewc.enabled);
            let options = TaskOptions {
                task_name: task.name.clone(),
                epochs: config.training.epochs,
                ewc_lambda: config.ewc.lambda,
                logging_steps: config.training.logging_steps,
                progress: config.training.progress,
            };
            let mut optimizer = config.training.optimizer_config().build_for(&model)?;
            let epochs = train_task(&mut model, &loader, &mut optimizer, ewc, options)
                .collect::<Result<Vec<_>>>()?;
            let ewc_applied = ewc.is_some();

            seen.push((task.name.clone(), loader));
            let evaluations = seen
                .iter()
                .map(|(name, loader)| evaluate(&mut model, loader, name))
                .collect::<Result<Vec<_>>>()?;
            for eval in &evaluations {
                tracing::info!(
                    "After {}: accuracy on {} = {:.3} (loss {:.4})",
                    task.name,
                    eval.task,
                    eval.accuracy,
                    eval.loss
                );
            }

            let checkpoint = Path::new(&config.output_dir).join(format!("task-{}-{}", i + 1, task.name));
            std::fs::create_dir_all(&checkpoint)?;
            model.save_weights(checkpoint.join("model.safetensors"))?;

            if config.ewc.enabled {
                let (_, loader) = &seen[i];
                let consolidated = Ewc::new(&mut model, loader, config.ewc.sample_limit)?;
                consolidated.save(checkpoint.join("ewc.safetensors"))?;
                previous = Some(consolidated);
            }

            let report = TaskReport {
                index: i + 1,
                task: task.name.clone(),
                ewc_applied,
                epochs,
                evaluations,
                checkpoint: checkpoint.clone(),
            };
            std::fs::write(
                checkpoint.join("training_state.json"),
                serde_json::to_string_pretty(&report)?,
            )?;
            tracing::info!("Saved checkpoint to: {}", checkpoint.display());
            reports.push(report);
        }

        std::fs::write(
            Path::new(&config.output_dir).join("report.json"),
            serde_json::to_string_pretty(&reports)?,
        )?;
        Ok(reports)
    }
}

/// Pick the training device: CUDA when compiled in and available, CPU otherwise.
///
/// `EWC_FORCE_CPU=1` forces the CPU; `EWC_CUDA_DEVICE` selects the GPU ordinal.
pub fn select_device() -> Device {
    let force_cpu = std::env::var("EWC_FORCE_CPU")
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let cuda_device = std::env::var("EWC_CUDA_DEVICE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if force_cpu || !cfg!(feature = "cuda") {
        if force_cpu {
            tracing::info!("CPU mode forced via EWC_FORCE_CPU");
        }
        return Device::Cpu;
    }
    match Device::cuda_if_available(cuda_device) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Training device: CUDA (device {})", cuda_device);
            device
        }
        Ok(_) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            Device::Cpu
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}
