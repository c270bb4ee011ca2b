//! Optimizer implementations (AdamW, SGD).

use candle_core::backprop::GradStore;
use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

use crate::config::OptimizerKind;
use crate::error::{ContinualError, Result};
use crate::model::Model;

/// Optimizer configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Which update rule to use
    pub kind: OptimizerKind,
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::AdamW,
            learning_rate: 2e-5,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.01,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Create an optimizer over the trainable parameters of `model`.
    ///
    /// # Errors
    ///
    /// Returns an error if a trainable parameter is not backed by a variable or the
    /// optimizer cannot be created.
    pub fn build_for<M: Model + ?Sized>(&self, model: &M) -> Result<TaskOptimizer> {
        let vars = model
            .trainable_parameters()
            .into_iter()
            .map(|p| {
                if !p.tensor.is_variable() {
                    return Err(ContinualError::Training(format!(
                        "trainable parameter `{}` is not backed by a variable",
                        p.name
                    )));
                }
                Ok(Var::from_tensor(&p.tensor)?)
            })
            .collect::<Result<Vec<_>>>()?;
        self.build(vars)
    }

    /// Create an optimizer over `vars`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build(&self, vars: Vec<Var>) -> Result<TaskOptimizer> {
        TaskOptimizer::new(vars, self.clone())
            .map_err(|e| ContinualError::Training(format!("Failed to create optimizer: {e}")))
    }
}

/// Config-selected optimizer.
pub enum TaskOptimizer {
    /// Decoupled weight-decay Adam.
    AdamW(AdamW),
    /// Plain stochastic gradient descent.
    Sgd(SGD),
}

impl Optimizer for TaskOptimizer {
    type Config = OptimizerConfig;

    fn new(vars: Vec<Var>, config: OptimizerConfig) -> candle_core::Result<Self> {
        match config.kind {
            OptimizerKind::AdamW => {
                let params = ParamsAdamW {
                    lr: config.learning_rate,
                    beta1: config.beta1,
                    beta2: config.beta2,
                    eps: config.eps,
                    weight_decay: config.weight_decay,
                };
                Ok(Self::AdamW(AdamW::new(vars, params)?))
            }
            OptimizerKind::Sgd => Ok(Self::Sgd(SGD::new(vars, config.learning_rate)?)),
        }
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        match self {
            Self::AdamW(opt) => opt.step(grads),
            Self::Sgd(opt) => opt.step(grads),
        }
    }

    fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}
