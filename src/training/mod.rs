/// Training infrastructure: optimizers, schedules, checkpoints and the step trainers

pub mod checkpoint;
pub mod margin_trainer;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{Checkpoint, CriterionStates};
pub use margin_trainer::JointMarginTrainer;
pub use optimizer::{AdamW, AdamWConfig, Optimizer, OptimizerState, Sgd, SgdConfig};
pub use scheduler::{CosineScheduler, CosineSchedulerConfig, LrScheduler, MultiStepLr, SchedulerState};
pub use trainer::{accuracy, StandardTrainer, StepMetrics, StepTrainer};
