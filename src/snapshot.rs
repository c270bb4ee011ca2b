//! Immutable parameter snapshots.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::error::Result;
use crate::model::Model;

/// Detached, independently owned copies of a model's trainable parameters.
///
/// Values are deep copies: candle optimizers update variables in place, so sharing storage
/// with the live parameters would let the snapshot drift with them.
#[derive(Debug, Clone, Default)]
pub struct ParameterSnapshot {
    values: BTreeMap<String, Tensor>,
}

impl ParameterSnapshot {
    /// Capture the current value of every trainable parameter of `model`.
    ///
    /// Frozen parameters are skipped. The model is not modified.
    ///
    /// # Errors
    ///
    /// Returns an error if copying a tensor fails.
    pub fn capture<M: Model + ?Sized>(model: &M) -> Result<Self> {
        let mut values = BTreeMap::new();
        for param in model.trainable_parameters() {
            values.insert(param.name, param.tensor.detach().copy()?);
        }
        tracing::debug!("Captured snapshot of {} parameters", values.len());
        Ok(Self { values })
    }

    /// Build a snapshot from already-owned tensors, deep-copying each one.
    ///
    /// # Errors
    ///
    /// Returns an error if copying a tensor fails.
    pub fn from_tensors<I>(tensors: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        let values = tensors
            .into_iter()
            .map(|(name, t)| Ok((name, t.detach().copy()?)))
            .collect::<Result<_>>()?;
        Ok(Self { values })
    }

    /// Snapshot value for `name`.
    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.values.get(name)
    }

    /// Whether `name` was captured.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of captured parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Captured names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// `(name, value)` pairs in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.values.iter().map(|(n, t)| (n.as_str(), t))
    }
}
