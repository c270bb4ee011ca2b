//! Diagonal Fisher information estimation.
//!
//! The Fisher information of each trainable parameter is approximated by the mean of its
//! squared task-loss gradient over a reference dataset:
//!
//! ```text
//! F[name] = (1 / N) * Σ_batches grad(name)²
//! ```
//!
//! Candle returns a fresh [`candle_core::backprop::GradStore`] from every backward pass, so
//! gradients from one batch can never leak into the next.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor};

use crate::data::DataLoader;
use crate::error::{ContinualError, Result};
use crate::model::Model;

/// Per-parameter importance weights: non-negative tensors shaped like their parameters.
#[derive(Debug, Clone, Default)]
pub struct FisherWeights {
    weights: BTreeMap<String, Tensor>,
    batches: usize,
}

impl FisherWeights {
    /// Estimate Fisher weights for `model` over `data`.
    ///
    /// At most `sample_limit` batches are processed when a limit is given; otherwise the whole
    /// loader is consumed once. The model runs in eval mode for the estimate and its previous
    /// mode is restored afterwards.
    ///
    /// # Errors
    ///
    /// - [`ContinualError::EmptyDataset`] if no batch was processed.
    /// - [`ContinualError::ShapeMismatch`] if a gradient's shape differs from its parameter's.
    /// - Any error raised by the forward or backward pass.
    pub fn estimate<M, D>(model: &mut M, data: &D, sample_limit: Option<usize>) -> Result<Self>
    where
        M: Model + ?Sized,
        D: DataLoader + ?Sized,
    {
        let was_training = model.is_training();
        model.set_training(false);
        let result = accumulate(model, data, sample_limit);
        model.set_training(was_training);
        result
    }

    /// Build Fisher weights from precomputed tensors.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Checkpoint`] if any tensor holds a negative or non-finite
    /// value.
    pub fn from_tensors<I>(tensors: I, batches: usize) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        let mut weights = BTreeMap::new();
        for (name, tensor) in tensors {
            let min = tensor
                .to_dtype(DType::F32)?
                .flatten_all()?
                .min(0)?
                .to_scalar::<f32>()?;
            if !(min >= 0.0 && min.is_finite()) {
                return Err(ContinualError::Checkpoint(format!(
                    "fisher weights for `{name}` must be finite and non-negative (min {min})"
                )));
            }
            weights.insert(name, tensor.detach());
        }
        Ok(Self { weights, batches })
    }

    /// Weights for `name`.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.weights.get(name)
    }

    /// Number of parameters with weights.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Whether no parameter has weights.
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Number of batches the estimate averaged over.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// `(name, weights)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.weights.iter().map(|(n, t)| (n.as_str(), t))
    }

    /// Total Fisher mass per parameter (sum over elements).
    ///
    /// # Errors
    ///
    /// Returns an error if a reduction fails.
    pub fn totals(&self) -> Result<Vec<(String, f64)>> {
        self.weights
            .iter()
            .map(|(name, w)| {
                let total = w.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?;
                Ok((name.clone(), total))
            })
            .collect()
    }
}

fn accumulate<M, D>(model: &M, data: &D, sample_limit: Option<usize>) -> Result<FisherWeights>
where
    M: Model + ?Sized,
    D: DataLoader + ?Sized,
{
    let params = model.trainable_parameters();
    let mut sums = params
        .iter()
        .map(|p| Ok(p.tensor.zeros_like()?))
        .collect::<Result<Vec<Tensor>>>()?;

    tracing::info!(
        "Computing Fisher information over {} parameters (limit: {:?})",
        params.len(),
        sample_limit
    );

    let device = model.device().clone();
    let mut count = 0usize;
    for batch in data.batches().take(sample_limit.unwrap_or(usize::MAX)) {
        let batch = batch?.to_device(&device)?;
        let output = model.forward(&batch)?;
        let grads = output.loss.backward()?;

        for (param, sum) in params.iter().zip(sums.iter_mut()) {
            let Some(grad) = grads.get(&param.tensor) else {
                continue;
            };
            if grad.dims() != param.tensor.dims() {
                return Err(ContinualError::shape_mismatch(
                    &param.name,
                    param.tensor.dims(),
                    grad.dims(),
                ));
            }
            *sum = (&*sum + grad.sqr()?)?;
        }
        count += 1;
    }

    if count == 0 {
        return Err(ContinualError::EmptyDataset(
            "fisher estimation processed zero batches".into(),
        ));
    }

    let scale = 1.0 / count as f64;
    let weights = params
        .into_iter()
        .zip(sums)
        .map(|(param, sum)| Ok((param.name, sum.affine(scale, 0.0)?.detach())))
        .collect::<Result<BTreeMap<_, _>>>()?;

    tracing::info!("Fisher information computed from {} batches", count);
    Ok(FisherWeights {
        weights,
        batches: count,
    })
}
