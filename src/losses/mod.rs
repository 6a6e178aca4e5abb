/// Loss functions and the criterion union used by the trainers
use candle_core::Tensor;
use candle_nn::VarMap;

pub mod margin;

pub use margin::CombinedMarginLoss;

/// Parameterless loss on class logits
pub trait ClassificationLoss {
    /// `logits`: `[batch, num_classes]`, `labels`: u32 `[batch]` -> scalar
    fn forward(&self, logits: &Tensor, labels: &Tensor) -> crate::Result<Tensor>;
}

/// Loss with learnable parameters applied to an embedding
pub trait MarginLoss {
    /// `embedding`: `[batch, dim]`, `labels`: u32 `[batch]` -> (scalar loss,
    /// re-projected logits `[batch, num_classes]`)
    fn forward(&self, embedding: &Tensor, labels: &Tensor) -> crate::Result<(Tensor, Tensor)>;

    /// Trainable parameters of the loss
    fn varmap(&self) -> &VarMap;
}

/// The two kinds of criterion a trainer can be configured with
pub enum Criterion {
    Classification(Box<dyn ClassificationLoss>),
    Margin(Box<dyn MarginLoss>),
}

impl Criterion {
    pub fn kind(&self) -> &'static str {
        match self {
            Criterion::Classification(_) => "classification",
            Criterion::Margin(_) => "margin",
        }
    }
}

impl std::fmt::Debug for Criterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Criterion::{}", self.kind())
    }
}

/// Softmax cross-entropy averaged over the batch
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl ClassificationLoss for CrossEntropyLoss {
    fn forward(&self, logits: &Tensor, labels: &Tensor) -> crate::Result<Tensor> {
        Ok(candle_nn::loss::cross_entropy(logits, labels)?)
    }
}
