//! Batches and the data-loader capability.
//!
//! A [`DataLoader`] is a lazy, finite and restartable source of [`Batch`]es: every call to
//! [`DataLoader::batches`] starts a fresh pass in the same order.

use candle_core::{DType, Device, Tensor};

use crate::error::{ContinualError, Result};

/// One batch of tokenized classification examples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Token ids: `[batch, seq_len]`, `u32`.
    pub input_ids: Tensor,
    /// Attention mask: `[batch, seq_len]`, `1` for real tokens and `0` for padding.
    pub attention_mask: Tensor,
    /// Class indices: `[batch]`, `u32`.
    pub labels: Tensor,
}

impl Batch {
    /// Create a batch from its three tensors.
    pub fn new(input_ids: Tensor, attention_mask: Tensor, labels: Tensor) -> Self {
        Self {
            input_ids,
            attention_mask,
            labels,
        }
    }

    /// Number of examples in the batch.
    pub fn len(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    /// Whether the batch holds no examples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the batch onto `device`. A no-op when it already lives there.
    ///
    /// # Errors
    ///
    /// Returns an error if a device transfer fails.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        if self.input_ids.device().same_device(device) {
            return Ok(self.clone());
        }
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            attention_mask: self.attention_mask.to_device(device)?,
            labels: self.labels.to_device(device)?,
        })
    }
}

/// Capability interface for batch sources.
pub trait DataLoader {
    /// Start a new pass over the data.
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

impl DataLoader for [Batch] {
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.iter().cloned().map(Ok))
    }
}

impl DataLoader for Vec<Batch> {
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        self.as_slice().batches()
    }
}

/// In-memory loader slicing three stacked tensors into fixed-size batches.
///
/// Order is preserved; the final batch may be smaller than `batch_size`.
#[derive(Debug, Clone)]
pub struct TensorDataLoader {
    input_ids: Tensor,
    attention_mask: Tensor,
    labels: Tensor,
    batch_size: usize,
}

impl TensorDataLoader {
    /// Create a loader over `[n, seq_len]` ids and mask and `[n]` labels.
    ///
    /// # Errors
    ///
    /// Returns an error if `batch_size` is zero or the leading dimensions disagree.
    pub fn new(
        input_ids: Tensor,
        attention_mask: Tensor,
        labels: Tensor,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(ContinualError::Config("batch_size must be > 0".into()));
        }
        if input_ids.dims() != attention_mask.dims() {
            return Err(ContinualError::shape_mismatch(
                "attention_mask",
                input_ids.dims(),
                attention_mask.dims(),
            ));
        }
        let n = input_ids.dims().first().copied().unwrap_or(0);
        if labels.dims() != [n] {
            return Err(ContinualError::shape_mismatch("labels", &[n], labels.dims()));
        }
        Ok(Self {
            input_ids,
            attention_mask,
            labels,
            batch_size,
        })
    }

    /// Build a loader from row-major token ids and masks (each `seq_len` wide) and labels.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffers are inconsistent or tensor creation fails.
    pub fn from_rows(
        ids: Vec<u32>,
        mask: Vec<u32>,
        labels: Vec<u32>,
        seq_len: usize,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let n = labels.len();
        if ids.len() != n * seq_len || mask.len() != n * seq_len {
            return Err(ContinualError::Dataset(format!(
                "expected {} token slots for {n} examples, got {} ids and {} mask entries",
                n * seq_len,
                ids.len(),
                mask.len()
            )));
        }
        let input_ids = Tensor::from_vec(ids, (n, seq_len), device)?;
        let attention_mask = Tensor::from_vec(mask, (n, seq_len), device)?;
        let labels = Tensor::from_vec(labels, n, device)?;
        Self::new(input_ids, attention_mask, labels, batch_size)
    }

    /// Number of examples.
    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    /// Whether the loader holds no examples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of batches one pass yields.
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Configured batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn slice(&self, start: usize) -> Result<Batch> {
        let len = self.batch_size.min(self.len() - start);
        Ok(Batch::new(
            self.input_ids.narrow(0, start, len)?,
            self.attention_mask.narrow(0, start, len)?,
            self.labels.narrow(0, start, len)?,
        ))
    }
}

impl DataLoader for TensorDataLoader {
    fn batches(&self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(
            (0..self.len())
                .step_by(self.batch_size)
                .map(move |start| self.slice(start)),
        )
    }
}

/// Attention mask converted to `dtype`, shaped `[batch, seq_len, 1]` for broadcasting.
///
/// # Errors
///
/// Returns an error if the conversion fails.
pub fn expanded_mask(batch: &Batch, dtype: DType) -> Result<Tensor> {
    Ok(batch.attention_mask.to_dtype(dtype)?.unsqueeze(2)?)
}
