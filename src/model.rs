//! Model capability consumed by the EWC core.
//!
//! The core never looks inside a network. It only needs a forward pass that yields a scalar
//! task loss, an enumeration of named parameters, a train/eval switch and the device the
//! parameters live on. Any candle-backed model can satisfy [`Model`]; see
//! [`crate::classifier::ModerationClassifier`] for the reference implementation.

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;

use crate::data::Batch;
use crate::error::Result;

/// A named model parameter.
///
/// `tensor` is a handle onto the live parameter storage: for trainable parameters it is the
/// tensor of the backing [`Var`], so gradients computed through it land on the parameter.
#[derive(Debug, Clone)]
pub struct NamedParameter {
    /// Stable, fully qualified parameter name (e.g. `classifier.weight`).
    pub name: String,
    /// Live parameter tensor.
    pub tensor: Tensor,
    /// Whether the optimizer updates this parameter.
    pub requires_grad: bool,
}

impl NamedParameter {
    /// Trainable parameter backed by a candle variable.
    pub fn trainable(name: impl Into<String>, var: &Var) -> Self {
        Self {
            name: name.into(),
            tensor: var.as_tensor().clone(),
            requires_grad: true,
        }
    }

    /// Frozen parameter. The tensor is detached so no gradient flows into it.
    pub fn frozen(name: impl Into<String>, tensor: &Tensor) -> Self {
        Self {
            name: name.into(),
            tensor: tensor.detach(),
            requires_grad: false,
        }
    }
}

/// Output of a forward pass run with labels.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Scalar task loss (e.g. cross-entropy against the batch labels).
    pub loss: Tensor,
    /// Raw logits, `[batch, num_labels]` for classifiers.
    pub logits: Tensor,
}

/// Capability interface for a trainable sequence classifier.
pub trait Model {
    /// Run the forward pass on a batch, computing the model's native task loss from the
    /// batch labels.
    ///
    /// # Errors
    ///
    /// Returns an error if any tensor operation fails.
    fn forward(&self, batch: &Batch) -> Result<ModelOutput>;

    /// All parameters, trainable and frozen, in a stable order.
    fn named_parameters(&self) -> Vec<NamedParameter>;

    /// Toggle training behaviour (dropout). Gradients are computed in both modes.
    fn set_training(&mut self, training: bool);

    /// Whether the model is in training mode.
    fn is_training(&self) -> bool;

    /// Device holding the parameters.
    fn device(&self) -> &Device;

    /// Trainable parameters only.
    fn trainable_parameters(&self) -> Vec<NamedParameter> {
        self.named_parameters()
            .into_iter()
            .filter(|p| p.requires_grad)
            .collect()
    }
}

/// Enumerate the variables of a [`VarMap`] as trainable parameters, sorted by name.
pub fn varmap_parameters(varmap: &VarMap) -> Vec<NamedParameter> {
    let data = varmap
        .data()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut params: Vec<NamedParameter> = data
        .iter()
        .map(|(name, var)| NamedParameter::trainable(name.clone(), var))
        .collect();
    params.sort_by(|a, b| a.name.cmp(&b.name));
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_varmap_parameters_sorted_and_trainable() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.pp("z").get_with_hints(3, "weight", Init::Const(0.0))?;
        vb.pp("a").get_with_hints(2, "weight", Init::Const(1.0))?;

        let params = varmap_parameters(&varmap);
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a.weight", "z.weight"]);
        assert!(params.iter().all(|p| p.requires_grad));
        Ok(())
    }

    #[test]
    fn test_trainable_parameter_receives_gradients() -> Result<()> {
        let var = Var::new(&[1.0f32, 2.0], &Device::Cpu)?;
        let param = NamedParameter::trainable("w", &var);

        let loss = param.tensor.sqr()?.sum_all()?;
        let grads = loss.backward()?;
        let grad = grads.get(&var).map(|g| g.to_vec1::<f32>()).transpose()?;
        assert_eq!(grad, Some(vec![2.0, 4.0]));
        Ok(())
    }

    #[test]
    fn test_frozen_parameter_is_detached() -> Result<()> {
        let var = Var::new(&[3.0f32], &Device::Cpu)?;
        let frozen = NamedParameter::frozen("emb", var.as_tensor());
        assert!(!frozen.requires_grad);

        let loss = frozen.tensor.sqr()?.sum_all()?;
        let grads = loss.backward()?;
        assert!(grads.get(&var).is_none());
        Ok(())
    }
}
