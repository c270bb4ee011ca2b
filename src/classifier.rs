//! Reference sequence classifier.
//!
//! Embedding bag with masked mean pooling, dropout and a linear head, trained with
//! cross-entropy. Small enough to train on CPU in tests, and a concrete [`Model`] for the
//! CLI. With `freeze_embeddings` the embedding table is kept out of the optimizer and out of
//! the EWC snapshot.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Dropout, Embedding, Linear, VarBuilder, VarMap};

use crate::config::ModelSettings;
use crate::data::{expanded_mask, Batch};
use crate::error::{ContinualError, Result};
use crate::model::{varmap_parameters, Model, ModelOutput, NamedParameter};

/// Embedding-bag moderation classifier.
pub struct ModerationClassifier {
    embeddings: Embedding,
    dropout: Dropout,
    classifier: Linear,
    trainable: VarMap,
    frozen: VarMap,
    num_labels: usize,
    training: bool,
    device: Device,
}

impl ModerationClassifier {
    /// Create a randomly initialised classifier.
    ///
    /// # Errors
    ///
    /// Returns an error if parameter allocation fails.
    pub fn new(
        settings: &ModelSettings,
        vocab_size: usize,
        num_labels: usize,
        device: &Device,
    ) -> Result<Self> {
        if vocab_size == 0 || num_labels == 0 {
            return Err(ContinualError::Config(format!(
                "classifier needs vocab_size > 0 and num_labels > 0 (got {vocab_size}, {num_labels})"
            )));
        }

        let trainable = VarMap::new();
        let frozen = VarMap::new();
        let vb = VarBuilder::from_varmap(&trainable, DType::F32, device);

        let embeddings = if settings.freeze_embeddings {
            let frozen_vb = VarBuilder::from_varmap(&frozen, DType::F32, device);
            let table = candle_nn::embedding(vocab_size, settings.hidden_size, frozen_vb.pp("embeddings"))?;
            Embedding::new(table.embeddings().detach(), settings.hidden_size)
        } else {
            candle_nn::embedding(vocab_size, settings.hidden_size, vb.pp("embeddings"))?
        };
        let classifier = candle_nn::linear(settings.hidden_size, num_labels, vb.pp("classifier"))?;

        tracing::info!(
            "Created classifier: vocab={}, hidden={}, labels={}, frozen embeddings={}",
            vocab_size,
            settings.hidden_size,
            num_labels,
            settings.freeze_embeddings
        );

        Ok(Self {
            embeddings,
            dropout: Dropout::new(settings.dropout),
            classifier,
            trainable,
            frozen,
            num_labels,
            training: true,
            device: device.clone(),
        })
    }

    /// Number of output classes.
    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Logits for a batch, `[batch, num_labels]`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn logits(&self, batch: &Batch) -> Result<Tensor> {
        let hidden = self.embeddings.forward(&batch.input_ids)?;
        let mask = expanded_mask(batch, hidden.dtype())?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?.clamp(1.0, f64::MAX)?;
        let pooled = summed.broadcast_div(&counts)?;
        let pooled = self.dropout.forward(&pooled, self.training)?;
        Ok(self.classifier.forward(&pooled)?)
    }

    /// Predicted class index per example.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn predict(&self, batch: &Batch) -> Result<Vec<u32>> {
        Ok(self.logits(batch)?.argmax(D::Minus1)?.to_vec1::<u32>()?)
    }

    /// Save all parameters, trainable and frozen, to a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Checkpoint`] if writing fails.
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let tensors: HashMap<String, Tensor> = self
            .named_parameters()
            .into_iter()
            .map(|p| (p.name, p.tensor))
            .collect();
        candle_core::safetensors::save(&tensors, path.as_ref()).map_err(|e| {
            ContinualError::Checkpoint(format!(
                "failed to save weights to {}: {e}",
                path.as_ref().display()
            ))
        })
    }

    /// Load parameters written by [`ModerationClassifier::save_weights`] in place.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Checkpoint`] if the file cannot be read or a parameter is
    /// missing, and [`ContinualError::ShapeMismatch`] if a stored shape differs.
    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let tensors = candle_core::safetensors::load(path.as_ref(), &self.device).map_err(|e| {
            ContinualError::Checkpoint(format!(
                "failed to load weights from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        for varmap in [&self.trainable, &self.frozen] {
            let data = varmap
                .data()
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for (name, var) in data.iter() {
                let stored = tensors.get(name).ok_or_else(|| {
                    ContinualError::Checkpoint(format!("missing parameter `{name}`"))
                })?;
                if stored.dims() != var.dims() {
                    return Err(ContinualError::shape_mismatch(name, var.dims(), stored.dims()));
                }
                var.set(&stored.to_dtype(var.dtype())?)?;
            }
        }
        tracing::info!("Loaded weights from {}", path.as_ref().display());
        Ok(())
    }
}

impl Model for ModerationClassifier {
    fn forward(&self, batch: &Batch) -> Result<ModelOutput> {
        let logits = self.logits(batch)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;
        Ok(ModelOutput { loss, logits })
    }

    fn named_parameters(&self) -> Vec<NamedParameter> {
        let mut params = varmap_parameters(&self.trainable);
        params.extend(
            varmap_parameters(&self.frozen)
                .into_iter()
                .map(|p| NamedParameter::frozen(p.name, &p.tensor)),
        );
        params.sort_by(|a, b| a.name.cmp(&b.name));
        params
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
