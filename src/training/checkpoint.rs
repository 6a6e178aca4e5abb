/// Resumable training checkpoints with safetensors
///
/// One file per checkpoint. Tensors are stored under section prefixes
/// (`state_dict_network.<param>`, `state_optimizer.<param>.<buffer>`, ...);
/// counters and JSON-encoded optimizer/scheduler states live in the
/// safetensors header metadata.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use safetensors::tensor::SafeTensors;
use serde::{Deserialize, Serialize};

use super::optimizer::OptimizerState;
use super::scheduler::SchedulerState;
use crate::utils::StateDict;
use crate::TrainError;

pub const FORMAT_VERSION: &str = "1";

pub const KEY_FORMAT_VERSION: &str = "format_version";
pub const KEY_EPOCH: &str = "epoch";
pub const KEY_GLOBAL_STEP: &str = "global_step";
pub const KEY_NETWORK: &str = "state_dict_network";
pub const KEY_OPTIMIZER: &str = "state_optimizer";
pub const KEY_LR_SCHEDULER: &str = "state_lr_scheduler";
pub const KEY_CRITERION: &str = "state_criterion";
pub const KEY_OPTIMIZER_CRITERION: &str = "state_optimizer_criterion";
pub const KEY_LR_SCHEDULER_CRITERION: &str = "state_lr_scheduler_criterion";

/// State of a margin criterion and its dedicated optimizer/schedule
#[derive(Debug, Clone)]
pub struct CriterionStates {
    pub params: StateDict,
    pub optimizer: OptimizerState,
    pub lr_scheduler: SchedulerState,
}

/// Everything needed to continue a run
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub epoch: usize,
    pub global_step: usize,
    pub network: StateDict,
    pub optimizer: OptimizerState,
    /// Network schedule; absent when the run has none
    pub lr_scheduler: Option<SchedulerState>,
    /// Present for joint margin training only
    pub criterion: Option<CriterionStates>,
}

#[derive(Serialize, Deserialize)]
struct OptimizerMeta {
    kind: String,
    learning_rate: f64,
    step: usize,
    buffers: Vec<String>,
}

/// `checkpoint_<epoch>_<step>.safetensors`
pub fn checkpoint_file_name(epoch: usize, step: usize) -> String {
    format!("checkpoint_{}_{}.safetensors", epoch, step)
}

/// Path of the checkpoint for `(epoch, step)` under `dir`
pub fn checkpoint_path<P: AsRef<Path>>(dir: P, epoch: usize, step: usize) -> PathBuf {
    dir.as_ref().join(checkpoint_file_name(epoch, step))
}

impl Checkpoint {
    /// Save checkpoint to file
    ///
    /// The bytes go to a sibling temp file first and are renamed into place,
    /// so `path` either holds the previous content or the complete new one.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let path = path.as_ref();

        let mut tensors: Vec<(String, Tensor)> = Vec::new();
        let mut metadata: HashMap<String, String> = HashMap::new();

        metadata.insert(KEY_FORMAT_VERSION.to_string(), FORMAT_VERSION.to_string());
        metadata.insert(KEY_EPOCH.to_string(), self.epoch.to_string());
        metadata.insert(KEY_GLOBAL_STEP.to_string(), self.global_step.to_string());

        put_section(&mut tensors, &mut metadata, KEY_NETWORK, &self.network)?;
        put_optimizer(&mut tensors, &mut metadata, KEY_OPTIMIZER, &self.optimizer)?;
        if let Some(ref scheduler) = self.lr_scheduler {
            metadata.insert(KEY_LR_SCHEDULER.to_string(), serde_json::to_string(scheduler)?);
        }

        if let Some(ref criterion) = self.criterion {
            put_section(&mut tensors, &mut metadata, KEY_CRITERION, &criterion.params)?;
            put_optimizer(&mut tensors, &mut metadata, KEY_OPTIMIZER_CRITERION, &criterion.optimizer)?;
            metadata.insert(
                KEY_LR_SCHEDULER_CRITERION.to_string(),
                serde_json::to_string(&criterion.lr_scheduler)?,
            );
        }

        let bytes = safetensors::tensor::serialize(tensors, &Some(metadata))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("safetensors.tmp");
        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, path)?;

        log::debug!("Wrote checkpoint {:?} ({} bytes)", path, bytes.len());
        Ok(())
    }

    /// Load checkpoint from file
    ///
    /// # Arguments
    /// * `path` - Path to checkpoint file
    /// * `device` - Device to load tensors on
    ///
    /// # Returns
    /// The fully parsed checkpoint; any missing field is an error
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> crate::Result<Self> {
        let data = std::fs::read(path.as_ref())?;

        let (_, header) = SafeTensors::read_metadata(&data)?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let mut tensors = candle_core::safetensors::load_buffer(&data, device)?;

        let version = required(&metadata, KEY_FORMAT_VERSION)?;
        if version != FORMAT_VERSION {
            return Err(TrainError::Checkpoint(format!(
                "unsupported checkpoint format version {} (expected {})",
                version, FORMAT_VERSION
            )));
        }

        let epoch = parse_counter(&metadata, KEY_EPOCH)?;
        let global_step = parse_counter(&metadata, KEY_GLOBAL_STEP)?;
        let network = take_section(&metadata, &mut tensors, KEY_NETWORK)?;
        let optimizer = take_optimizer(&metadata, &mut tensors, KEY_OPTIMIZER)?;

        let lr_scheduler = metadata
            .get(KEY_LR_SCHEDULER)
            .map(|s| serde_json::from_str::<SchedulerState>(s))
            .transpose()?;

        let criterion_keys = [KEY_CRITERION, KEY_OPTIMIZER_CRITERION, KEY_LR_SCHEDULER_CRITERION];
        let criterion = if criterion_keys.iter().any(|k| metadata.contains_key(*k)) {
            Some(CriterionStates {
                params: take_section(&metadata, &mut tensors, KEY_CRITERION)?,
                optimizer: take_optimizer(&metadata, &mut tensors, KEY_OPTIMIZER_CRITERION)?,
                lr_scheduler: serde_json::from_str(required(&metadata, KEY_LR_SCHEDULER_CRITERION)?)?,
            })
        } else {
            None
        };

        Ok(Self {
            epoch,
            global_step,
            network,
            optimizer,
            lr_scheduler,
            criterion,
        })
    }
}

fn required<'a>(metadata: &'a HashMap<String, String>, key: &str) -> crate::Result<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| TrainError::MissingKey(key.to_string()))
}

fn parse_counter(metadata: &HashMap<String, String>, key: &str) -> crate::Result<usize> {
    let raw = required(metadata, key)?;
    raw.parse()
        .map_err(|_| TrainError::Checkpoint(format!("`{}` is not a counter: {:?}", key, raw)))
}

fn put_section(
    tensors: &mut Vec<(String, Tensor)>,
    metadata: &mut HashMap<String, String>,
    section: &str,
    state: &StateDict,
) -> crate::Result<()> {
    let mut names: Vec<&String> = state.keys().collect();
    names.sort();
    metadata.insert(section.to_string(), serde_json::to_string(&names)?);
    for name in names {
        tensors.push((format!("{}.{}", section, name), state[name].clone()));
    }
    Ok(())
}

fn take_section(
    metadata: &HashMap<String, String>,
    tensors: &mut HashMap<String, Tensor>,
    section: &str,
) -> crate::Result<StateDict> {
    let names: Vec<String> = serde_json::from_str(required(metadata, section)?)?;
    let mut state = HashMap::with_capacity(names.len());
    for name in names {
        let key = format!("{}.{}", section, name);
        let tensor = tensors.remove(&key).ok_or_else(|| TrainError::MissingKey(key))?;
        state.insert(name, tensor);
    }
    Ok(state)
}

fn put_optimizer(
    tensors: &mut Vec<(String, Tensor)>,
    metadata: &mut HashMap<String, String>,
    section: &str,
    state: &OptimizerState,
) -> crate::Result<()> {
    let mut buffers: Vec<String> = state.buffers.keys().cloned().collect();
    buffers.sort();
    for key in &buffers {
        tensors.push((format!("{}.{}", section, key), state.buffers[key].clone()));
    }
    let meta = OptimizerMeta {
        kind: state.kind.clone(),
        learning_rate: state.learning_rate,
        step: state.step,
        buffers,
    };
    metadata.insert(section.to_string(), serde_json::to_string(&meta)?);
    Ok(())
}

fn take_optimizer(
    metadata: &HashMap<String, String>,
    tensors: &mut HashMap<String, Tensor>,
    section: &str,
) -> crate::Result<OptimizerState> {
    let meta: OptimizerMeta = serde_json::from_str(required(metadata, section)?)?;
    let mut buffers = HashMap::with_capacity(meta.buffers.len());
    for name in meta.buffers {
        let key = format!("{}.{}", section, name);
        let tensor = tensors.remove(&key).ok_or_else(|| TrainError::MissingKey(key))?;
        buffers.insert(name, tensor);
    }
    Ok(OptimizerState {
        kind: meta.kind,
        learning_rate: meta.learning_rate,
        step: meta.step,
        buffers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn sample_checkpoint(device: &Device, with_criterion: bool) -> crate::Result<Checkpoint> {
        let mut network = HashMap::new();
        network.insert("head.weight".to_string(), Tensor::randn(0f32, 1.0, (3, 4), device)?);
        network.insert("head.bias".to_string(), Tensor::zeros(3, DType::F32, device)?);

        let mut buffers = HashMap::new();
        buffers.insert(
            "head.weight.exp_avg".to_string(),
            Tensor::ones((3, 4), DType::F32, device)?,
        );
        let optimizer = OptimizerState {
            kind: "adamw".to_string(),
            learning_rate: 3e-4,
            step: 12,
            buffers,
        };

        let criterion = if with_criterion {
            let mut params = HashMap::new();
            params.insert("weight".to_string(), Tensor::randn(0f32, 0.01, (3, 4), device)?);
            let mut buffers = HashMap::new();
            buffers.insert(
                "weight.momentum_buffer".to_string(),
                Tensor::full(0.5f32, (3, 4), device)?,
            );
            Some(CriterionStates {
                params,
                optimizer: OptimizerState {
                    kind: "sgd".to_string(),
                    learning_rate: 0.001,
                    step: 12,
                    buffers,
                },
                lr_scheduler: SchedulerState {
                    kind: "multi_step".to_string(),
                    last_epoch: 7,
                    base_lr: 0.01,
                },
            })
        } else {
            None
        };

        Ok(Checkpoint {
            epoch: 7,
            global_step: 12,
            network,
            optimizer,
            lr_scheduler: None,
            criterion,
        })
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> crate::Result<f32> {
        Ok((a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_checkpoint_file_name() {
        assert_eq!(checkpoint_file_name(3, 1500), "checkpoint_3_1500.safetensors");
        assert_eq!(
            checkpoint_path("runs", 1, 2),
            PathBuf::from("runs").join("checkpoint_1_2.safetensors")
        );
    }

    #[test]
    fn test_save_load_checkpoint() -> crate::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = checkpoint_path(dir.path(), 7, 12);

        let checkpoint = sample_checkpoint(&device, true)?;
        checkpoint.save(&path)?;
        assert!(path.exists());
        assert!(!path.with_extension("safetensors.tmp").exists());

        let loaded = Checkpoint::load(&path, &device)?;
        assert_eq!(loaded.epoch, 7);
        assert_eq!(loaded.global_step, 12);
        assert!(loaded.lr_scheduler.is_none());
        assert_eq!(loaded.optimizer.kind, "adamw");
        assert_eq!(loaded.optimizer.learning_rate, 3e-4);
        assert_eq!(loaded.optimizer.step, 12);

        for (name, tensor) in &checkpoint.network {
            assert_eq!(max_abs_diff(tensor, &loaded.network[name])?, 0.0);
        }

        let criterion = loaded.criterion.expect("criterion section");
        assert_eq!(criterion.lr_scheduler.last_epoch, 7);
        assert_eq!(criterion.optimizer.kind, "sgd");
        assert!(criterion.optimizer.buffers.contains_key("weight.momentum_buffer"));

        Ok(())
    }

    #[test]
    fn test_optional_scheduler_roundtrip() -> crate::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = checkpoint_path(dir.path(), 1, 1);

        let mut checkpoint = sample_checkpoint(&device, false)?;
        checkpoint.lr_scheduler = Some(SchedulerState {
            kind: "cosine".to_string(),
            last_epoch: 1,
            base_lr: 1e-3,
        });
        checkpoint.save(&path)?;

        let loaded = Checkpoint::load(&path, &device)?;
        assert_eq!(loaded.lr_scheduler, checkpoint.lr_scheduler);
        assert!(loaded.criterion.is_none());

        Ok(())
    }

    #[test]
    fn test_missing_file() {
        let result = Checkpoint::load("does/not/exist.safetensors", &Device::Cpu);
        assert!(matches!(result, Err(TrainError::Io(_))));
    }

    #[test]
    fn test_partial_criterion_section_is_missing_key() -> crate::Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.safetensors");

        // network section only, plus a stray criterion schedule entry
        let mut tensors = Vec::new();
        let mut metadata = HashMap::new();
        let checkpoint = sample_checkpoint(&device, false)?;
        metadata.insert(KEY_FORMAT_VERSION.to_string(), FORMAT_VERSION.to_string());
        metadata.insert(KEY_EPOCH.to_string(), "1".to_string());
        metadata.insert(KEY_GLOBAL_STEP.to_string(), "2".to_string());
        put_section(&mut tensors, &mut metadata, KEY_NETWORK, &checkpoint.network)?;
        put_optimizer(&mut tensors, &mut metadata, KEY_OPTIMIZER, &checkpoint.optimizer)?;
        metadata.insert(
            KEY_LR_SCHEDULER_CRITERION.to_string(),
            r#"{"kind":"multi_step","last_epoch":0,"base_lr":0.01}"#.to_string(),
        );
        let bytes = safetensors::tensor::serialize(tensors, &Some(metadata))?;
        std::fs::write(&path, bytes)?;

        match Checkpoint::load(&path, &device) {
            Err(TrainError::MissingKey(key)) => assert_eq!(key, KEY_CRITERION),
            other => panic!("expected MissingKey, got {:?}", other.map(|c| c.epoch)),
        }

        Ok(())
    }
}
