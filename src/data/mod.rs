/// Batch container shared by the trainers
use candle_core::{DType, Device, Tensor};

use crate::TrainError;

/// One supervised batch: token ids, audio features and class labels
///
/// - `input_ids`: u32 `[batch, seq_len]`
/// - `audio`: float `[batch, features]` or `[batch, frames, features]`
/// - `label`: u32 `[batch]`
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Tensor,
    pub audio: Tensor,
    pub label: Tensor,
}

impl Batch {
    /// Create a batch, checking that the three parts agree on batch size
    pub fn new(input_ids: Tensor, audio: Tensor, label: Tensor) -> crate::Result<Self> {
        let batch = Self {
            input_ids,
            audio,
            label,
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Number of examples
    pub fn len(&self) -> usize {
        self.label.dims().first().copied().unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check the shared leading dimension and label layout
    pub fn validate(&self) -> crate::Result<()> {
        if self.label.rank() != 1 {
            return Err(TrainError::Contract(format!(
                "label must be rank 1, got shape {:?}",
                self.label.dims()
            )));
        }

        if self.label.dtype() != DType::U32 {
            return Err(TrainError::Contract(format!(
                "label must be u32 class indices, got {:?}",
                self.label.dtype()
            )));
        }

        let batch_size = self.len();
        if batch_size == 0 {
            return Err(TrainError::Contract("empty batch".to_string()));
        }

        for (name, tensor) in [("input_ids", &self.input_ids), ("audio", &self.audio)] {
            let leading = tensor.dims().first().copied();
            if leading != Some(batch_size) {
                return Err(TrainError::Contract(format!(
                    "{} has shape {:?}, expected leading dimension {}",
                    name,
                    tensor.dims(),
                    batch_size
                )));
            }
        }

        Ok(())
    }

    /// Copy every component to `device`
    ///
    /// Blocks until the transfer is complete.
    pub fn to_device(&self, device: &Device) -> crate::Result<Self> {
        self.validate()?;
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            audio: self.audio.to_device(device)?,
            label: self.label.to_device(device)?,
        })
    }
}
