/// Epoch-indexed learning rate schedules
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::TrainError;

/// Serializable scheduler state
///
/// The rate is a pure function of `last_epoch`, so this is all a schedule
/// needs to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Schedule family, checked on restore
    pub kind: String,
    /// Number of completed `step` calls
    pub last_epoch: usize,
    /// Rate the multiplier is applied to
    pub base_lr: f64,
}

/// A learning rate schedule advanced once per epoch
pub trait LrScheduler {
    /// Advance one epoch and return the rate to apply
    fn step(&mut self) -> f64;

    /// Rate for the current position
    fn get_lr(&self) -> f64;

    /// Number of completed steps
    fn last_epoch(&self) -> usize;

    fn state(&self) -> SchedulerState;

    /// Validate `state` without applying it
    fn check_state(&self, state: &SchedulerState) -> crate::Result<()>;

    fn load_state(&mut self, state: &SchedulerState) -> crate::Result<()>;
}

fn check_kind(expected: &str, state: &SchedulerState) -> crate::Result<()> {
    if state.kind != expected {
        return Err(TrainError::Checkpoint(format!(
            "scheduler state is for `{}`, expected `{}`",
            state.kind, expected
        )));
    }
    Ok(())
}

/// `gamma ^ |{m in milestones : m - 1 <= last_epoch}|`
///
/// Milestones are 1-indexed epochs; `last_epoch` counts completed steps.
pub fn milestone_multiplier(last_epoch: usize, milestones: &[usize], gamma: f64) -> f64 {
    let passed = milestones
        .iter()
        .filter(|&&m| m.saturating_sub(1) <= last_epoch)
        .count();
    gamma.powi(passed as i32)
}

/// Step decay at fixed milestones
pub struct MultiStepLr {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    last_epoch: usize,
}

impl MultiStepLr {
    pub fn new(base_lr: f64, milestones: Vec<usize>, gamma: f64) -> Self {
        Self {
            base_lr,
            milestones,
            gamma,
            last_epoch: 0,
        }
    }

    /// Multiplier after `last_epoch` completed steps
    pub fn multiplier(&self, last_epoch: usize) -> f64 {
        milestone_multiplier(last_epoch, &self.milestones, self.gamma)
    }

    /// Multiplier in effect during 1-indexed running `epoch`
    ///
    /// Epoch 0 (before training starts) uses the undecayed rate.
    pub fn running_epoch_multiplier(&self, epoch: usize) -> f64 {
        match epoch.checked_sub(1) {
            Some(last_epoch) => self.multiplier(last_epoch),
            None => 1.0,
        }
    }
}

impl LrScheduler for MultiStepLr {
    fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.get_lr()
    }

    fn get_lr(&self) -> f64 {
        self.base_lr * self.multiplier(self.last_epoch)
    }

    fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            kind: "multi_step".to_string(),
            last_epoch: self.last_epoch,
            base_lr: self.base_lr,
        }
    }

    fn check_state(&self, state: &SchedulerState) -> crate::Result<()> {
        check_kind("multi_step", state)
    }

    fn load_state(&mut self, state: &SchedulerState) -> crate::Result<()> {
        self.check_state(state)?;
        self.last_epoch = state.last_epoch;
        self.base_lr = state.base_lr;
        Ok(())
    }
}

/// Cosine annealing learning rate scheduler configuration
#[derive(Debug, Clone)]
pub struct CosineSchedulerConfig {
    /// Initial learning rate
    pub lr_init: f64,
    /// Minimum learning rate (at end of schedule)
    pub lr_min: f64,
    /// Number of warmup epochs
    pub warmup_epochs: usize,
    /// Total number of epochs
    pub total_epochs: usize,
}

impl Default for CosineSchedulerConfig {
    fn default() -> Self {
        Self {
            lr_init: 1e-3,
            lr_min: 1e-5,
            warmup_epochs: 2,
            total_epochs: 30,
        }
    }
}

/// Cosine learning rate scheduler
///
/// Implements cosine annealing with linear warmup:
/// - Linear warmup from lr_init / warmup_epochs to lr_init
/// - Cosine annealing from lr_init to lr_min over remaining epochs
pub struct CosineScheduler {
    config: CosineSchedulerConfig,
    last_epoch: usize,
}

impl CosineScheduler {
    /// Create new cosine scheduler
    pub fn new(config: CosineSchedulerConfig) -> Self {
        Self {
            config,
            last_epoch: 0,
        }
    }

    /// Get learning rate for a specific epoch
    pub fn get_lr_at(&self, epoch: usize) -> f64 {
        if epoch < self.config.warmup_epochs {
            // Warmup never starts at zero so the first epoch still trains
            self.config.lr_init * ((epoch + 1) as f64 / self.config.warmup_epochs as f64)
        } else {
            let span = self.config.total_epochs.saturating_sub(self.config.warmup_epochs).max(1);
            let progress = ((epoch - self.config.warmup_epochs) as f64 / span as f64).clamp(0.0, 1.0);

            // lr = lr_min + (lr_init - lr_min) * 0.5 * (1 + cos(pi * progress))
            let cosine_factor = 0.5 * (1.0 + (PI * progress).cos());
            self.config.lr_min + (self.config.lr_init - self.config.lr_min) * cosine_factor
        }
    }
}

impl LrScheduler for CosineScheduler {
    fn step(&mut self) -> f64 {
        self.last_epoch += 1;
        self.get_lr()
    }

    fn get_lr(&self) -> f64 {
        self.get_lr_at(self.last_epoch)
    }

    fn last_epoch(&self) -> usize {
        self.last_epoch
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            kind: "cosine".to_string(),
            last_epoch: self.last_epoch,
            base_lr: self.config.lr_init,
        }
    }

    fn check_state(&self, state: &SchedulerState) -> crate::Result<()> {
        check_kind("cosine", state)
    }

    fn load_state(&mut self, state: &SchedulerState) -> crate::Result<()> {
        self.check_state(state)?;
        self.last_epoch = state.last_epoch;
        self.config.lr_init = state.base_lr;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MILESTONES: [usize; 4] = [8, 14, 20, 25];

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_milestone_law() {
        for last_epoch in 0..40 {
            let expected = 0.1f64.powi(MILESTONES.iter().filter(|&&m| m - 1 <= last_epoch).count() as i32);
            assert_eq!(milestone_multiplier(last_epoch, &MILESTONES, 0.1), expected);
        }
    }

    #[test]
    fn test_running_epoch_multiplier() {
        let scheduler = MultiStepLr::new(0.01, MILESTONES.to_vec(), 0.1);

        for epoch in 0..=7 {
            assert!(close(scheduler.running_epoch_multiplier(epoch), 1.0), "epoch {}", epoch);
        }
        for epoch in 8..=13 {
            assert!(close(scheduler.running_epoch_multiplier(epoch), 0.1), "epoch {}", epoch);
        }
        for epoch in 14..=19 {
            assert!(close(scheduler.running_epoch_multiplier(epoch), 0.01), "epoch {}", epoch);
        }
        for epoch in 20..=24 {
            assert!(close(scheduler.running_epoch_multiplier(epoch), 0.001), "epoch {}", epoch);
        }
        for epoch in 25..=40 {
            assert!(close(scheduler.running_epoch_multiplier(epoch), 0.0001), "epoch {}", epoch);
        }
    }

    #[test]
    fn test_multi_step_stepping() {
        let mut scheduler = MultiStepLr::new(0.01, MILESTONES.to_vec(), 0.1);
        assert_eq!(scheduler.get_lr(), 0.01);

        // the 7th step enters the 8th running epoch
        for _ in 0..6 {
            assert_eq!(scheduler.step(), 0.01);
        }
        let lr = scheduler.step();
        assert_eq!(scheduler.last_epoch(), 7);
        assert!(close(lr, 0.001));
    }

    #[test]
    fn test_multi_step_state_roundtrip() -> crate::Result<()> {
        let mut a = MultiStepLr::new(0.01, MILESTONES.to_vec(), 0.1);
        for _ in 0..9 {
            a.step();
        }

        let mut b = MultiStepLr::new(0.01, MILESTONES.to_vec(), 0.1);
        b.load_state(&a.state())?;

        assert_eq!(a.get_lr(), b.get_lr());
        assert_eq!(a.step(), b.step());

        Ok(())
    }

    #[test]
    fn test_kind_mismatch() {
        let cosine = CosineScheduler::new(CosineSchedulerConfig::default());
        let mut multi = MultiStepLr::new(0.01, MILESTONES.to_vec(), 0.1);
        assert!(multi.load_state(&cosine.state()).is_err());
    }

    #[test]
    fn test_warmup_phase() {
        let config = CosineSchedulerConfig {
            lr_init: 1.0,
            lr_min: 0.0,
            warmup_epochs: 4,
            total_epochs: 20,
        };

        let scheduler = CosineScheduler::new(config);

        assert!(close(scheduler.get_lr_at(0), 0.25));
        assert!(close(scheduler.get_lr_at(1), 0.5));
        assert!(close(scheduler.get_lr_at(4), 1.0));
    }

    #[test]
    fn test_cosine_annealing() {
        let config = CosineSchedulerConfig {
            lr_init: 1.0,
            lr_min: 0.0,
            warmup_epochs: 0,
            total_epochs: 10,
        };

        let scheduler = CosineScheduler::new(config);

        assert!(close(scheduler.get_lr_at(0), 1.0));
        assert!((scheduler.get_lr_at(5) - 0.5).abs() < 1e-9);
        assert!(close(scheduler.get_lr_at(10), 0.0));
        assert!(close(scheduler.get_lr_at(15), 0.0));
    }

    #[test]
    fn test_lr_never_exceeds_init() {
        let config = CosineSchedulerConfig {
            lr_init: 1.0,
            lr_min: 0.1,
            warmup_epochs: 3,
            total_epochs: 30,
        };

        let scheduler = CosineScheduler::new(config.clone());

        for epoch in 0..=config.total_epochs {
            let lr = scheduler.get_lr_at(epoch);
            assert!(lr <= config.lr_init + 1e-9, "LR {} exceeds max {} at epoch {}", lr, config.lr_init, epoch);
        }

        for epoch in config.warmup_epochs..=config.total_epochs {
            let lr = scheduler.get_lr_at(epoch);
            assert!(lr >= config.lr_min - 1e-9, "LR {} is below min {} at epoch {}", lr, config.lr_min, epoch);
        }
    }
}
