//! Multimodal emotion classifier training core
//!
//! Per-batch step execution, joint optimization of a network and a
//! margin-based loss, and resumable checkpoints, built on candle.
//!
//! # Architecture
//!
//! - **StandardTrainer**: fixed classification loss on the network logits,
//!   one optimizer
//! - **JointMarginTrainer**: margin loss with its own parameters, optimized by
//!   a second SGD optimizer and milestone schedule next to the network's
//! - **Checkpoint**: safetensors container holding every piece of state
//!   needed to continue a run exactly where it stopped
//!
//! # Example
//!
//! ```ignore
//! use mmser_trainer::{Criterion, FusionClassifier, FusionConfig, JointMarginTrainer};
//! use mmser_trainer::losses::CombinedMarginLoss;
//! use mmser_trainer::training::{AdamW, AdamWConfig, StepTrainer};
//!
//! let network = FusionClassifier::new(FusionConfig::default(), &device)?;
//! let optimizer = AdamW::new(named_parameters(network.varmap())?, AdamWConfig::default())?;
//! let criterion = Criterion::Margin(Box::new(CombinedMarginLoss::new(margin_config, &device)?));
//! let mut trainer = JointMarginTrainer::new(network, criterion, Box::new(optimizer), device, Default::default())?;
//! let metrics = trainer.train_step(&batch)?;
//! ```

pub mod config;
pub mod data;
pub mod losses;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::{FusionConfig, MarginLossConfig, MarginOptimConfig};
pub use data::Batch;
pub use losses::Criterion;
pub use models::{FusionClassifier, Network, NetworkOutput};
pub use training::{JointMarginTrainer, StandardTrainer, StepMetrics, StepTrainer};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Checkpoint is missing key `{0}`")]
    MissingKey(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, TrainError>;
