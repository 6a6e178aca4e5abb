/// Step execution for a single classification loss and single optimizer
use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::checkpoint::{checkpoint_path, Checkpoint};
use super::optimizer::Optimizer;
use super::scheduler::LrScheduler;
use crate::data::Batch;
use crate::losses::ClassificationLoss;
use crate::models::Network;
use crate::utils;
use crate::TrainError;

/// Metrics returned by a step, already detached and copied to the host
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepMetrics {
    pub loss: f32,
    pub acc: f32,
}

impl StepMetrics {
    /// Detach both scalars from the graph and bring them to the CPU
    pub(crate) fn from_tensors(loss: &Tensor, acc: &Tensor) -> crate::Result<Self> {
        let loss = loss
            .detach()
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .to_scalar::<f32>()?;
        let acc = acc.detach().to_device(&Device::Cpu)?.to_scalar::<f32>()?;
        Ok(Self { loss, acc })
    }
}

/// The contract a training driver relies on
///
/// The driver owns epoch/batch iteration: it calls `train_step` or
/// `test_step` per batch, `lr_scheduler` once per epoch, and decides when to
/// save.
pub trait StepTrainer {
    /// One optimization step on `batch`
    fn train_step(&mut self, batch: &Batch) -> crate::Result<StepMetrics>;

    /// One evaluation step; never mutates trainer state
    fn test_step(&self, batch: &Batch) -> crate::Result<StepMetrics>;

    /// Advance the learning rate schedules by one epoch
    fn lr_scheduler(&mut self, step: usize, epoch: usize) -> crate::Result<()>;

    /// Write `checkpoint_<epoch>_<step>` under `dir` and return its path
    fn save_all_states(&self, dir: &Path, global_epoch: usize, global_step: usize) -> crate::Result<PathBuf>;

    /// Restore everything written by `save_all_states`
    fn load_all_states(&mut self, path: &Path, device: &Device) -> crate::Result<()>;

    /// Epoch to resume from (0 for a fresh run)
    fn start_epoch(&self) -> usize;

    /// Number of optimization steps taken so far
    fn global_step(&self) -> usize;
}

/// Fraction of rows whose argmax equals the label
pub fn accuracy(logits: &Tensor, labels: &Tensor) -> crate::Result<Tensor> {
    let preds = logits.argmax(1)?;
    Ok(preds.eq(labels)?.to_dtype(DType::F32)?.mean_all()?)
}

/// Check that `logits` is `[batch, classes]` and every label is in range
pub(crate) fn check_logits(logits: &Tensor, labels: &Tensor) -> crate::Result<()> {
    if logits.rank() != 2 {
        return Err(TrainError::Contract(format!(
            "logits must be [batch, num_classes], got {:?}",
            logits.dims()
        )));
    }

    let (batch_size, num_classes) = logits.dims2()?;
    if batch_size != labels.dim(0)? {
        return Err(TrainError::Contract(format!(
            "logits batch {} does not match {} labels",
            batch_size,
            labels.dim(0)?
        )));
    }

    if let Some(max_label) = labels.to_vec1::<u32>()?.into_iter().max() {
        if max_label as usize >= num_classes {
            return Err(TrainError::Contract(format!(
                "label {} out of range for {} classes",
                max_label, num_classes
            )));
        }
    }

    Ok(())
}

/// Trainer for a parameterless classification loss
pub struct StandardTrainer<N: Network> {
    network: N,
    criterion: Option<Box<dyn ClassificationLoss>>,
    optimizer: Box<dyn Optimizer>,
    scheduler: Option<Box<dyn LrScheduler>>,
    device: Device,
    start_epoch: usize,
    global_step: usize,
}

impl<N: Network> StandardTrainer<N> {
    /// Create new trainer
    ///
    /// The network's parameters must already live on `device`; they are not
    /// moved afterwards.
    pub fn new(network: N, optimizer: Box<dyn Optimizer>, device: Device) -> crate::Result<Self> {
        utils::ensure_device(network.varmap(), &device, "network")?;

        log::info!(
            "StandardTrainer on {:?}: {} network parameters",
            device,
            utils::count_parameters(network.varmap())
        );

        Ok(Self {
            network,
            criterion: None,
            optimizer,
            scheduler: None,
            device,
            start_epoch: 0,
            global_step: 0,
        })
    }

    pub fn with_criterion(mut self, criterion: Box<dyn ClassificationLoss>) -> Self {
        self.criterion = Some(criterion);
        self
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

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn scheduler(&self) -> Option<&dyn LrScheduler> {
        self.scheduler.as_deref()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn criterion(&self) -> crate::Result<&dyn ClassificationLoss> {
        self.criterion
            .as_deref()
            .ok_or_else(|| TrainError::Config("no criterion configured".to_string()))
    }

    fn snapshot(&self, global_epoch: usize, global_step: usize) -> crate::Result<Checkpoint> {
        Ok(Checkpoint {
            epoch: global_epoch,
            global_step,
            network: utils::state_dict(self.network.varmap())?,
            optimizer: self.optimizer.state()?,
            lr_scheduler: self.scheduler.as_ref().map(|s| s.state()),
            criterion: None,
        })
    }
}

impl<N: Network> StepTrainer for StandardTrainer<N> {
    fn train_step(&mut self, batch: &Batch) -> crate::Result<StepMetrics> {
        let criterion = self.criterion()?;
        let batch = batch.to_device(&self.device)?;

        // gradients come fresh from each backward pass
        let output = self.network.forward_t(&batch.input_ids, &batch.audio, true)?;
        check_logits(&output.logits, &batch.label)?;
        let loss = criterion.forward(&output.logits, &batch.label)?;

        let grads = loss.backward()?;
        self.optimizer.step(&grads)?;
        self.global_step += 1;

        let acc = accuracy(&output.logits, &batch.label)?;
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
        let criterion = self.criterion()?;
        let batch = batch.to_device(&self.device)?;

        let output = self
            .network
            .forward_t(&batch.input_ids, &batch.audio, false)?
            .detach();
        check_logits(&output.logits, &batch.label)?;
        let loss = criterion.forward(&output.logits, &batch.label)?;

        let acc = accuracy(&output.logits, &batch.label)?;
        StepMetrics::from_tensors(&loss, &acc)
    }

    fn lr_scheduler(&mut self, step: usize, epoch: usize) -> crate::Result<()> {
        if let Some(ref mut scheduler) = self.scheduler {
            let lr = scheduler.step();
            self.optimizer.set_learning_rate(lr);
            log::debug!("epoch {} (step {}): network lr={:.6}", epoch, step, lr);
        }
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

        // validate everything before touching any state
        utils::check_state_dict(self.network.varmap(), &checkpoint.network, "state_dict_network")?;
        self.optimizer.check_state(&checkpoint.optimizer)?;
        let scheduler_state = match (&self.scheduler, &checkpoint.lr_scheduler) {
            (Some(scheduler), Some(state)) => {
                scheduler.check_state(state)?;
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
        if let (Some(scheduler), Some(state)) = (self.scheduler.as_mut(), scheduler_state) {
            scheduler.load_state(state)?;
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

/// Move optimizer buffers loaded on an arbitrary device to the trainer's
pub(crate) fn to_device(
    mut state: super::optimizer::OptimizerState,
    device: &Device,
) -> crate::Result<super::optimizer::OptimizerState> {
    for tensor in state.buffers.values_mut() {
        *tensor = tensor.to_device(device)?;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FusionConfig;
    use crate::losses::CrossEntropyLoss;
    use crate::models::FusionClassifier;
    use crate::training::optimizer::{AdamW, AdamWConfig, Sgd, SgdConfig};
    use crate::training::scheduler::{CosineScheduler, CosineSchedulerConfig};
    use crate::utils::named_parameters;

    fn tiny_config() -> FusionConfig {
        FusionConfig {
            vocab_size: 32,
            text_dim: 8,
            audio_dim: 6,
            hidden_size: 16,
            num_classes: 4,
            dropout: 0.0,
        }
    }

    fn fixed_batch(device: &Device) -> crate::Result<Batch> {
        let input_ids = Tensor::new(
            &[
                [1u32, 2, 3, 4],
                [5, 6, 7, 8],
                [9, 10, 11, 12],
                [13, 14, 15, 16],
                [17, 18, 19, 20],
                [21, 22, 23, 24],
            ],
            device,
        )?;
        let audio = Tensor::randn(0f32, 1.0, (6, 6), device)?;
        let label = Tensor::new(&[0u32, 1, 2, 3, 0, 1], device)?;
        Batch::new(input_ids, audio, label)
    }

    fn trainer(device: &Device) -> crate::Result<StandardTrainer<FusionClassifier>> {
        let network = FusionClassifier::new(tiny_config(), device)?;
        let optimizer = AdamW::new(
            named_parameters(network.varmap())?,
            AdamWConfig {
                lr: 1e-2,
                ..Default::default()
            },
        )?;
        Ok(StandardTrainer::new(network, Box::new(optimizer), device.clone())?
            .with_criterion(Box::new(CrossEntropyLoss)))
    }

    #[test]
    fn test_overfit_one_batch() -> crate::Result<()> {
        let device = Device::Cpu;
        let mut trainer = trainer(&device)?;
        let batch = fixed_batch(&device)?;

        let first = trainer.train_step(&batch)?;
        let mut last = first;
        for _ in 0..40 {
            last = trainer.train_step(&batch)?;
        }

        assert!(last.loss < first.loss, "loss {} did not drop below {}", last.loss, first.loss);
        assert_eq!(trainer.global_step(), 41);

        Ok(())
    }

    #[test]
    fn test_test_step_is_pure() -> crate::Result<()> {
        let device = Device::Cpu;
        let trainer = trainer(&device)?;
        let batch = fixed_batch(&device)?;

        let before = utils::state_dict(trainer.network().varmap())?;
        let a = trainer.test_step(&batch)?;
        let b = trainer.test_step(&batch)?;
        assert_eq!(a, b);
        assert_eq!(trainer.global_step(), 0);

        let after = utils::state_dict(trainer.network().varmap())?;
        for (name, tensor) in &before {
            let diff = (tensor - &after[name])?.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert_eq!(diff, 0.0, "{} changed", name);
        }

        Ok(())
    }

    #[test]
    fn test_accuracy_matches_argmax() -> crate::Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(
            &[[2.0f32, 0.1, 0.0], [0.0, 3.0, 0.5], [1.0, 0.0, 4.0], [0.9, 0.1, 0.0]],
            &device,
        )?;
        let labels = Tensor::new(&[0u32, 1, 1, 2], &device)?;

        let acc = accuracy(&logits, &labels)?.to_scalar::<f32>()?;
        assert_eq!(acc, 0.5);

        Ok(())
    }

    #[test]
    fn test_accuracy_in_unit_interval() -> crate::Result<()> {
        let device = Device::Cpu;
        let mut trainer = trainer(&device)?;
        let batch = fixed_batch(&device)?;

        for _ in 0..5 {
            let metrics = trainer.train_step(&batch)?;
            assert!((0.0..=1.0).contains(&metrics.acc));
            // six examples: accuracy is a multiple of 1/6
            let scaled = metrics.acc * 6.0;
            assert!((scaled - scaled.round()).abs() < 1e-4);
        }

        Ok(())
    }

    #[test]
    fn test_missing_criterion_is_config_error() -> crate::Result<()> {
        let device = Device::Cpu;
        let network = FusionClassifier::new(tiny_config(), &device)?;
        let optimizer = Sgd::new(named_parameters(network.varmap())?, SgdConfig::default())?;
        let mut trainer = StandardTrainer::new(network, Box::new(optimizer), device.clone())?;
        let batch = fixed_batch(&device)?;

        assert!(matches!(trainer.train_step(&batch), Err(TrainError::Config(_))));
        assert!(matches!(trainer.test_step(&batch), Err(TrainError::Config(_))));

        Ok(())
    }

    #[test]
    fn test_label_out_of_range() -> crate::Result<()> {
        let device = Device::Cpu;
        let mut trainer = trainer(&device)?;
        let input_ids = Tensor::zeros((2, 3), DType::U32, &device)?;
        let audio = Tensor::zeros((2, 6), DType::F32, &device)?;
        let label = Tensor::new(&[0u32, 9], &device)?;
        let batch = Batch::new(input_ids, audio, label)?;

        assert!(matches!(trainer.train_step(&batch), Err(TrainError::Contract(_))));
        assert_eq!(trainer.global_step(), 0);

        Ok(())
    }

    #[test]
    fn test_save_load_resumes_identically() -> crate::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let batch = fixed_batch(&device)?;
        let schedule = || {
            Box::new(CosineScheduler::new(CosineSchedulerConfig {
                lr_init: 1e-2,
                lr_min: 1e-4,
                warmup_epochs: 1,
                total_epochs: 10,
            }))
        };

        let mut original = trainer(&device)?.with_scheduler(schedule());
        for epoch in 1..=3 {
            original.train_step(&batch)?;
            original.lr_scheduler(original.global_step(), epoch)?;
        }
        let path = original.save_all_states(dir.path(), 3, original.global_step())?;
        assert_eq!(path, dir.path().join("checkpoint_3_3.safetensors"));

        let mut resumed = trainer(&device)?.with_scheduler(schedule());
        resumed.load_all_states(&path, &device)?;

        assert_eq!(resumed.start_epoch(), 3);
        assert_eq!(resumed.global_step(), 3);
        assert_eq!(resumed.optimizer().learning_rate(), original.optimizer().learning_rate());
        assert_eq!(
            resumed.scheduler().map(|s| s.last_epoch()),
            original.scheduler().map(|s| s.last_epoch())
        );

        let a = original.train_step(&batch)?;
        let b = resumed.train_step(&batch)?;
        assert!((a.loss - b.loss).abs() < 1e-6);
        assert_eq!(a.acc, b.acc);

        Ok(())
    }

    #[test]
    fn test_missing_scheduler_state_is_fatal() -> crate::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;

        let plain = trainer(&device)?;
        let path = plain.save_all_states(dir.path(), 0, 0)?;

        let mut scheduled = trainer(&device)?
            .with_scheduler(Box::new(CosineScheduler::new(CosineSchedulerConfig::default())));
        let before = utils::state_dict(scheduled.network().varmap())?;

        match scheduled.load_all_states(&path, &device) {
            Err(TrainError::MissingKey(key)) => assert_eq!(key, "state_lr_scheduler"),
            other => panic!("expected MissingKey, got {:?}", other),
        }

        // nothing was applied
        let after = utils::state_dict(scheduled.network().varmap())?;
        for (name, tensor) in &before {
            let diff = (tensor - &after[name])?.abs()?.sum_all()?.to_scalar::<f32>()?;
            assert_eq!(diff, 0.0);
        }

        Ok(())
    }
}
