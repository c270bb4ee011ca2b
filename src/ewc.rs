//! Elastic Weight Consolidation penalty.
//!
//! ```text
//! penalty(θ) = Σ_name Σ_i F[name]_i * (θ[name]_i - θ*[name]_i)²
//! ```
//!
//! The `λ / 2` weighting is applied by the caller (see [`crate::trainer::train_task`]).

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::data::DataLoader;
use crate::error::{ContinualError, Result};
use crate::fisher::FisherWeights;
use crate::model::Model;
use crate::snapshot::ParameterSnapshot;

const SNAPSHOT_PREFIX: &str = "snapshot.";
const FISHER_PREFIX: &str = "fisher.";

/// Consolidated knowledge of one finished task: reference parameters plus their Fisher
/// importance weights.
///
/// Every Fisher entry has a snapshot entry of identical shape.
#[derive(Debug, Clone)]
pub struct Ewc {
    snapshot: ParameterSnapshot,
    fisher: FisherWeights,
}

impl Ewc {
    /// Snapshot `model` and estimate its Fisher weights on the old task's `data`.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`ParameterSnapshot::capture`] and
    /// [`FisherWeights::estimate`].
    pub fn new<M, D>(model: &mut M, data: &D, sample_limit: Option<usize>) -> Result<Self>
    where
        M: Model + ?Sized,
        D: DataLoader + ?Sized,
    {
        let snapshot = ParameterSnapshot::capture(model)?;
        let fisher = FisherWeights::estimate(model, data, sample_limit)?;
        Self::from_parts(snapshot, fisher)
    }

    /// Pair an existing snapshot with Fisher weights.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Checkpoint`] if a Fisher entry has no snapshot entry and
    /// [`ContinualError::ShapeMismatch`] if their shapes differ.
    pub fn from_parts(snapshot: ParameterSnapshot, fisher: FisherWeights) -> Result<Self> {
        for (name, weights) in fisher.iter() {
            let reference = snapshot.get(name).ok_or_else(|| {
                ContinualError::Checkpoint(format!("fisher entry `{name}` has no snapshot"))
            })?;
            if reference.dims() != weights.dims() {
                return Err(ContinualError::shape_mismatch(
                    name,
                    reference.dims(),
                    weights.dims(),
                ));
            }
        }
        Ok(Self { snapshot, fisher })
    }

    /// Unscaled EWC penalty of `model`'s current parameters.
    ///
    /// Only trainable parameters whose name has Fisher weights contribute; Fisher names the
    /// model no longer has are skipped. The result is a scalar that stays attached to the
    /// autograd graph, so its gradient flows back into the model's variables.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::ShapeMismatch`] if a live parameter's shape differs from its
    /// snapshot.
    pub fn penalty<M: Model + ?Sized>(&self, model: &M) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for param in model.trainable_parameters() {
            let (Some(weights), Some(reference)) =
                (self.fisher.get(&param.name), self.snapshot.get(&param.name))
            else {
                continue;
            };
            if param.tensor.dims() != reference.dims() {
                return Err(ContinualError::shape_mismatch(
                    &param.name,
                    reference.dims(),
                    param.tensor.dims(),
                ));
            }
            let drift = param.tensor.sub(reference)?.sqr()?;
            let term = drift.mul(weights)?.sum_all()?;
            total = Some(match total {
                Some(acc) => (acc + term)?,
                None => term,
            });
        }
        match total {
            Some(total) => Ok(total),
            None => Ok(Tensor::zeros((), DType::F32, model.device())?),
        }
    }

    /// Reference parameters.
    pub fn snapshot(&self) -> &ParameterSnapshot {
        &self.snapshot
    }

    /// Fisher importance weights.
    pub fn fisher(&self) -> &FisherWeights {
        &self.fisher
    }

    /// Save snapshot and Fisher tensors to a single safetensors file.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Checkpoint`] if writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for (name, t) in self.snapshot.iter() {
            tensors.insert(format!("{SNAPSHOT_PREFIX}{name}"), t.clone());
        }
        for (name, t) in self.fisher.iter() {
            tensors.insert(format!("{FISHER_PREFIX}{name}"), t.clone());
        }
        candle_core::safetensors::save(&tensors, path.as_ref()).map_err(|e| {
            ContinualError::Checkpoint(format!(
                "failed to save EWC state to {}: {e}",
                path.as_ref().display()
            ))
        })?;
        tracing::info!(
            "Saved EWC state ({} parameters) to {}",
            self.fisher.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Load EWC state written by [`Ewc::save`], re-validating the snapshot/Fisher pairing.
    ///
    /// `batches` is not persisted and reads back as zero.
    ///
    /// # Errors
    ///
    /// Returns [`ContinualError::Checkpoint`] if the file cannot be read, holds unknown
    /// tensors or violates the pairing invariant.
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path.as_ref(), device).map_err(|e| {
            ContinualError::Checkpoint(format!(
                "failed to load EWC state from {}: {e}",
                path.as_ref().display()
            ))
        })?;

        let mut snapshot = Vec::new();
        let mut fisher = Vec::new();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix(SNAPSHOT_PREFIX) {
                snapshot.push((name.to_string(), tensor));
            } else if let Some(name) = key.strip_prefix(FISHER_PREFIX) {
                fisher.push((name.to_string(), tensor));
            } else {
                return Err(ContinualError::Checkpoint(format!(
                    "unexpected tensor `{key}` in EWC state"
                )));
            }
        }

        Self::from_parts(
            ParameterSnapshot::from_tensors(snapshot)?,
            FisherWeights::from_tensors(fisher, 0)?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;
    use crate::model::{ModelOutput, NamedParameter};
    use candle_core::Var;
    use tempfile::TempDir;

    struct Scalar {
        p: Var,
        device: Device,
    }

    impl Model for Scalar {
        fn forward(&self, batch: &Batch) -> Result<ModelOutput> {
            let target = batch.labels.to_dtype(DType::F32)?.sum_all()?;
            let loss = self.p.as_tensor().sum_all()?.sub(&target)?.sqr()?;
            Ok(ModelOutput {
                logits: loss.clone(),
                loss,
            })
        }

        fn named_parameters(&self) -> Vec<NamedParameter> {
            vec![NamedParameter::trainable("p0", &self.p)]
        }

        fn set_training(&mut self, _training: bool) {}

        fn is_training(&self) -> bool {
            true
        }

        fn device(&self) -> &Device {
            &self.device
        }
    }

    fn scalar(value: f32) -> Scalar {
        let device = Device::Cpu;
        Scalar {
            p: Var::new(&[value], &device).unwrap(),
            device,
        }
    }

    fn fixed_ewc(reference: f32, fisher: f32) -> Ewc {
        let device = Device::Cpu;
        let snapshot = ParameterSnapshot::from_tensors([(
            "p0".to_string(),
            Tensor::new(&[reference], &device).unwrap(),
        )])
        .unwrap();
        let fisher = FisherWeights::from_tensors(
            [("p0".to_string(), Tensor::new(&[fisher], &device).unwrap())],
            1,
        )
        .unwrap();
        Ewc::from_parts(snapshot, fisher).unwrap()
    }

    #[test]
    fn test_penalty_of_drifted_scalar() -> Result<()> {
        let ewc = fixed_ewc(1.0, 2.0);
        let model = scalar(1.5);

        let penalty = ewc.penalty(&model)?.to_scalar::<f32>()?;
        assert!((penalty - 0.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_penalty_gradient_flows_into_parameter() -> Result<()> {
        let ewc = fixed_ewc(1.0, 2.0);
        let model = scalar(1.5);

        let grads = ewc.penalty(&model)?.backward()?;
        // d/dp 2 (p - 1)² = 4 (p - 1) = 2
        let grad = grads.get(&model.p).unwrap().to_vec1::<f32>()?;
        assert!((grad[0] - 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_penalty_zero_right_after_construction() -> Result<()> {
        let mut model = scalar(0.25);
        let batch = Batch::new(
            Tensor::new(&[[0u32]], &Device::Cpu)?,
            Tensor::new(&[[1u32]], &Device::Cpu)?,
            Tensor::new(&[2u32], &Device::Cpu)?,
        );
        let ewc = Ewc::new(&mut model, &vec![batch], None)?;
        assert_eq!(ewc.penalty(&model)?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_missing_parameters_are_skipped() -> Result<()> {
        let ewc = fixed_ewc(1.0, 2.0);

        struct Renamed(Var, Device);
        impl Model for Renamed {
            fn forward(&self, _batch: &Batch) -> Result<ModelOutput> {
                unreachable!()
            }
            fn named_parameters(&self) -> Vec<NamedParameter> {
                vec![NamedParameter::trainable("new_head", &self.0)]
            }
            fn set_training(&mut self, _training: bool) {}
            fn is_training(&self) -> bool {
                true
            }
            fn device(&self) -> &Device {
                &self.1
            }
        }

        let model = Renamed(Var::new(&[100.0f32], &Device::Cpu)?, Device::Cpu);
        assert_eq!(ewc.penalty(&model)?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_shape_change_is_a_mismatch() {
        let ewc = fixed_ewc(1.0, 2.0);
        let device = Device::Cpu;
        let model = Scalar {
            p: Var::new(&[1.0f32, 2.0], &device).unwrap(),
            device,
        };
        assert!(matches!(
            ewc.penalty(&model),
            Err(ContinualError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_from_parts_requires_snapshot_for_every_fisher_entry() {
        let snapshot = ParameterSnapshot::default();
        let fisher = FisherWeights::from_tensors(
            [("w".to_string(), Tensor::new(&[1.0f32], &Device::Cpu).unwrap())],
            1,
        )
        .unwrap();
        assert!(matches!(
            Ewc::from_parts(snapshot, fisher),
            Err(ContinualError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_save_and_load_round_trip_penalty() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("ewc.safetensors");
        let ewc = fixed_ewc(1.0, 2.0);
        ewc.save(&path)?;

        let restored = Ewc::load(&path, &Device::Cpu)?;
        let penalty = restored.penalty(&scalar(1.5))?.to_scalar::<f32>()?;
        assert!((penalty - 0.5).abs() < 1e-6);
        Ok(())
    }
}
