/// Joint training of a network and a margin loss with its own parameters
///
/// The network is optimized by the caller-supplied optimizer (and optional
/// schedule); the margin loss's class centers by a dedicated SGD optimizer
/// on a milestone schedule. Both groups are reachable from the same loss
/// tensor, so one backward pass feeds both optimizers.
use candle_core::Device;
use std::path::{Path, PathBuf};

use super::checkpoint::{checkpoint_path, Checkpoint, CriterionStates};
use super::optimizer::{Optimizer, Sgd, SgdConfig};
use super::scheduler::{LrScheduler, MultiStepLr};
use super::trainer::{accuracy, check_logits, to_device, StepMetrics, StepTrainer};
use crate::config::MarginOptimConfig;
use crate::data::Batch;
use crate::losses::{Criterion, MarginLoss};
use crate::models::Network;
use crate::utils;
use crate::TrainError;

pub struct JointMarginTrainer<N: Network> {
    network: N,
    criterion: Box<dyn MarginLoss>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<Box<dyn LrScheduler>>,
    criterion_optimizer: Sgd,
    criterion_scheduler: MultiStepLr,
    device: Device,
    start_epoch: usize,
    global_step: usize,
}

impl<N: Network> JointMarginTrainer<N> {
    /// Create new trainer
    ///
    /// Fails unless `criterion` is a margin loss. Network and criterion
    /// parameters must already live on `device`.
    pub fn new(
        network: N,
        criterion: Criterion,
        optimizer: Box<dyn Optimizer>,
        device: Device,
        config: MarginOptimConfig,
    ) -> crate::Result<Self> {
        let criterion = match criterion {
            Criterion::Margin(loss) => loss,
            other => {
                return Err(TrainError::Config(format!(
                    "JointMarginTrainer requires a margin criterion, got {}",
                    other.kind()
                )))
            }
        };
        config.validate()?;

        utils::ensure_device(network.varmap(), &device, "network")?;
        utils::ensure_device(criterion.varmap(), &device, "criterion")?;

        let criterion_optimizer = Sgd::new(
            utils::named_parameters(criterion.varmap())?,
            SgdConfig {
                lr: config.learning_rate,
                momentum: config.momentum,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        let criterion_scheduler = MultiStepLr::new(config.learning_rate, config.milestones, config.gamma);

        log::info!(
            "JointMarginTrainer on {:?}: {} network parameters, {} criterion parameters",
            device,
            utils::count_parameters(network.varmap()),
            utils::count_parameters(criterion.varmap())
        );

        let mut trainer = Self {
            network,
            criterion,
            optimizer,
            scheduler: None,
            criterion_optimizer,
            criterion_scheduler,
            device,
            start_epoch: 0,
            global_step: 0,
        };
        trainer.criterion_optimizer.set_learning_rate(trainer.criterion_scheduler.get_lr());
        Ok(trainer)
    }

    /// Attach a network schedule; the optimizer switches to its initial rate
    pub fn with_scheduler(mut self, scheduler: Box<dyn LrScheduler>) -> Self {
        self.optimizer.set_learning_rate(scheduler.get_lr());
        self.scheduler = Some(scheduler);
        self
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn criterion(&self) -> &dyn MarginLoss {
        self.criterion.as_ref()
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn scheduler(&self) -> Option<&dyn LrScheduler> {
        self.scheduler.as_deref()
    }

    pub fn criterion_optimizer(&self) -> &Sgd {
        &self.criterion_optimizer
    }

    pub fn criterion_scheduler(&self) -> &MultiStepLr {
        &self.criterion_scheduler
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn snapshot(&self, global_epoch: usize, global_step: usize) -> crate::Result<Checkpoint> {
        Ok(Checkpoint {
            epoch: global_epoch,
            global_step,
            network: utils::state_dict(self.network.varmap())?,
            optimizer: self.optimizer.state()?,
            lr_scheduler: self.scheduler.as_ref().map(|s| s.state()),
            criterion: Some(CriterionStates {
                params: utils::state_dict(self.criterion.varmap())?,
                optimizer: self.criterion_optimizer.state()?,
                lr_scheduler: self.criterion_scheduler.state(),
            }),
        })
    }
}

impl<N: Network> StepTrainer for JointMarginTrainer<N> {
    fn train_step(&mut self, batch: &Batch) -> crate::Result<StepMetrics> {
        let batch = batch.to_device(&self.device)?;

        // gradients for both parameter groups come fresh from this backward pass
        let output = self.network.forward_t(&batch.input_ids, &batch.audio, true)?;
        let (loss, logits) = self.criterion.forward(output.embedding()?, &batch.label)?;
        check_logits(&logits, &batch.label)?;

        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;
        self.criterion_optimizer.step(&grads)?;
        self.global_step += 1;

        let acc = accuracy(&logits, &batch.label)?;
        let metrics = StepMetrics::from_tensors(&loss, &acc)?;
        log::debug!(
            "train step {}: loss={:.4} acc={:.3}",
            self.global_step,
            metrics.loss,
            metrics.acc
        );
        Ok(metrics)
    }

    fn test_step(&self, batch: &Batch) -> crate::Result<StepMetrics> {
        let batch = batch.to_device(&self.device)?;

        let output = self
            .network
            .forward_t(&batch.input_ids, &batch.audio, false)?
            .detach();
        let (loss, logits) = self.criterion.forward(output.embedding()?, &batch.label)?;
        check_logits(&logits, &batch.label)?;

        let acc = accuracy(&logits, &batch.label)?;
        StepMetrics::from_tensors(&loss, &acc)
    }

    fn lr_scheduler(&mut self, step: usize, epoch: usize) -> crate::Result<()> {
        if let Some(ref mut scheduler) = self.scheduler {
            let lr = scheduler.step();
            self.optimizer.set_learning_rate(lr);
            log::debug!("epoch {} (step {}): network lr={:.6}", epoch, step, lr);
        }

        let lr = self.criterion_scheduler.step();
        self.criterion_optimizer.set_learning_rate(lr);
        log::debug!("epoch {} (step {}): criterion lr={:.6}", epoch, step, lr);

        Ok(())
    }

    fn save_all_states(&self, dir: &Path, global_epoch: usize, global_step: usize) -> crate::Result<PathBuf> {
        let path = checkpoint_path(dir, global_epoch, global_step);
        self.snapshot(global_epoch, global_step)?.save(&path)?;
        log::info!("Saved checkpoint to {}", path.display());
        Ok(path)
    }

    fn load_all_states(&mut self, path: &Path, device: &Device) -> crate::Result<()> {
        let checkpoint = Checkpoint::load(path, device)?;
        let criterion = checkpoint
            .criterion
            .ok_or_else(|| TrainError::MissingKey("state_criterion".to_string()))?;

        // validate everything before touching any state
        utils::check_state_dict(self.network.varmap(), &checkpoint.network, "state_dict_network")?;
        self.optimizer.check_state(&checkpoint.optimizer)?;
        utils::check_state_dict(self.criterion.varmap(), &criterion.params, "state_criterion")?;
        self.criterion_optimizer.check_state(&criterion.optimizer)?;
        self.criterion_scheduler.check_state(&criterion.lr_scheduler)?;
        let scheduler_state = match (&self.scheduler, checkpoint.lr_scheduler) {
            (Some(scheduler), Some(state)) => {
                scheduler.check_state(&state)?;
                Some(state)
            }
            (Some(_), None) => return Err(TrainError::MissingKey("state_lr_scheduler".to_string())),
            (None, Some(_)) => {
                log::warn!("Checkpoint has a network schedule but none is configured; ignoring it");
                None
            }
            (None, None) => None,
        };

        self.start_epoch = checkpoint.epoch;
        self.global_step = checkpoint.global_step;
        utils::load_state_dict(self.network.varmap(), &checkpoint.network, "state_dict_network")?;
        self.optimizer.load_state(to_device(checkpoint.optimizer, &self.device)?)?;
        utils::load_state_dict(self.criterion.varmap(), &criterion.params, "state_criterion")?;
        self.criterion_optimizer
            .load_state(to_device(criterion.optimizer, &self.device)?)?;
        self.criterion_scheduler.load_state(&criterion.lr_scheduler)?;
        if let (Some(scheduler), Some(state)) = (self.scheduler.as_mut(), scheduler_state) {
            scheduler.load_state(&state)?;
        }

        log::info!("Successfully loaded checkpoint from {}", path.display());
        log::info!("Resume training from epoch {}", self.start_epoch);
        Ok(())
    }

    fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    fn global_step(&self) -> usize {
        self.global_step
    }
}
