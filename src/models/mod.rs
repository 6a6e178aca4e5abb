/// Network contract consumed by the trainers
use candle_core::Tensor;
use candle_nn::VarMap;

pub mod fusion;

pub use fusion::FusionClassifier;

/// Result of a network forward pass
///
/// `logits` is the first output view (raw class scores, `[batch,
/// num_classes]`), `embedding` the second (feature representation,
/// `[batch, dim]`). Networks that only classify may leave `embedding` empty;
/// margin training then fails with a contract error.
#[derive(Debug, Clone)]
pub struct NetworkOutput {
    pub logits: Tensor,
    pub embedding: Option<Tensor>,
}

impl NetworkOutput {
    pub fn new(logits: Tensor, embedding: Tensor) -> Self {
        Self {
            logits,
            embedding: Some(embedding),
        }
    }

    /// Logits only
    pub fn logits_only(logits: Tensor) -> Self {
        Self {
            logits,
            embedding: None,
        }
    }

    /// The embedding view, or a contract error if the network has none
    pub fn embedding(&self) -> crate::Result<&Tensor> {
        self.embedding.as_ref().ok_or_else(|| {
            crate::TrainError::Contract("network output has no embedding view".to_string())
        })
    }

    /// Detached copy of both views
    pub fn detach(&self) -> Self {
        Self {
            logits: self.logits.detach(),
            embedding: self.embedding.as_ref().map(|e| e.detach()),
        }
    }
}

/// A multimodal classifier over (token ids, audio features)
///
/// Parameters live in one `VarMap` created on a single device when the
/// network is built.
pub trait Network {
    /// Forward pass; `train` toggles train-only behaviour such as dropout
    fn forward_t(&self, input_ids: &Tensor, audio: &Tensor, train: bool) -> crate::Result<NetworkOutput>;

    /// Trainable parameters
    fn varmap(&self) -> &VarMap;
}
