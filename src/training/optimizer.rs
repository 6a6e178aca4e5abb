/// Optimizers with checkpointable state
///
/// Parameters are candle `Var`s keyed by name; gradients come from the
/// `GradStore` returned by `Tensor::backward`. Per-parameter buffers are
/// stored under `<param>.<buffer>` so that state saved by one instance
/// restores into another regardless of varmap iteration order.
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use std::collections::HashMap;

use crate::TrainError;

/// Serializable optimizer state for one parameter group
#[derive(Debug, Clone)]
pub struct OptimizerState {
    /// Optimizer family, checked on restore
    pub kind: String,
    /// Current learning rate (after scheduling)
    pub learning_rate: f64,
    /// Number of steps taken
    pub step: usize,
    /// Per-parameter buffers
    pub buffers: HashMap<String, Tensor>,
}

/// Optimizer over one parameter group
pub trait Optimizer {
    /// Apply one update using the gradients in `grads`
    ///
    /// Parameters without a gradient are left untouched.
    fn step(&mut self, grads: &GradStore) -> crate::Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Snapshot of all mutable state (buffers are deep copies)
    fn state(&self) -> crate::Result<OptimizerState>;

    /// Validate `state` against this optimizer without applying it
    fn check_state(&self, state: &OptimizerState) -> crate::Result<()>;

    /// Replace all mutable state with `state`
    fn load_state(&mut self, state: OptimizerState) -> crate::Result<()>;
}

/// Shared validation: kind matches and every buffer belongs to a known
/// parameter with the same shape
fn check_buffers(
    kind: &str,
    params: &[(String, Var)],
    suffixes: &[&str],
    state: &OptimizerState,
) -> crate::Result<()> {
    if state.kind != kind {
        return Err(TrainError::Checkpoint(format!(
            "optimizer state is for `{}`, expected `{}`",
            state.kind, kind
        )));
    }

    for (key, buffer) in &state.buffers {
        let param = params.iter().find(|(name, _)| {
            suffixes
                .iter()
                .any(|suffix| key.strip_suffix(suffix).and_then(|k| k.strip_suffix('.')) == Some(name.as_str()))
        });
        match param {
            Some((_, var)) if var.dims() == buffer.dims() => {}
            Some((name, var)) => {
                return Err(TrainError::Checkpoint(format!(
                    "optimizer buffer `{}` has shape {:?}, parameter `{}` has {:?}",
                    key,
                    buffer.dims(),
                    name,
                    var.dims()
                )))
            }
            None => {
                return Err(TrainError::Checkpoint(format!(
                    "optimizer buffer `{}` matches no parameter",
                    key
                )))
            }
        }
    }

    Ok(())
}

fn copy_buffers(buffers: &HashMap<String, Tensor>) -> crate::Result<HashMap<String, Tensor>> {
    let mut copied = HashMap::with_capacity(buffers.len());
    for (key, tensor) in buffers {
        copied.insert(key.clone(), tensor.copy()?);
    }
    Ok(copied)
}

/// SGD configuration
#[derive(Debug, Clone)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub dampening: f64,
    pub weight_decay: f64,
    pub nesterov: bool,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }
}

/// Stochastic gradient descent with momentum and L2 weight decay
///
/// `g = grad + wd * p`, `buf = momentum * buf + (1 - dampening) * g` (the
/// first step initialises `buf = g`), `p -= lr * buf`.
pub struct Sgd {
    config: SgdConfig,
    params: Vec<(String, Var)>,
    buffers: HashMap<String, Tensor>,
    step: usize,
}

const MOMENTUM_BUFFER: &str = "momentum_buffer";

impl Sgd {
    pub fn new(params: Vec<(String, Var)>, config: SgdConfig) -> crate::Result<Self> {
        if config.nesterov && (config.momentum <= 0.0 || config.dampening != 0.0) {
            return Err(TrainError::Config(
                "nesterov momentum requires momentum > 0 and zero dampening".to_string(),
            ));
        }

        Ok(Self {
            config,
            params,
            buffers: HashMap::new(),
            step: 0,
        })
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    pub fn params(&self) -> &[(String, Var)] {
        &self.params
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, grads: &GradStore) -> crate::Result<()> {
        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };

            let mut update = grad.clone();
            if self.config.weight_decay != 0.0 {
                update = (update + var.as_tensor().affine(self.config.weight_decay, 0.0)?)?;
            }

            if self.config.momentum != 0.0 {
                let key = format!("{}.{}", name, MOMENTUM_BUFFER);
                let buf = match self.buffers.get(&key) {
                    Some(buf) => (buf.affine(self.config.momentum, 0.0)?
                        + update.affine(1.0 - self.config.dampening, 0.0)?)?,
                    None => update.clone(),
                }
                .detach();

                update = if self.config.nesterov {
                    (update + buf.affine(self.config.momentum, 0.0)?)?
                } else {
                    buf.clone()
                };
                self.buffers.insert(key, buf);
            }

            let next = (var.as_tensor() - update.affine(self.config.lr, 0.0)?)?.detach();
            var.set(&next)?;
        }

        self.step += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn state(&self) -> crate::Result<OptimizerState> {
        Ok(OptimizerState {
            kind: "sgd".to_string(),
            learning_rate: self.config.lr,
            step: self.step,
            buffers: copy_buffers(&self.buffers)?,
        })
    }

    fn check_state(&self, state: &OptimizerState) -> crate::Result<()> {
        check_buffers("sgd", &self.params, &[MOMENTUM_BUFFER], state)
    }

    fn load_state(&mut self, state: OptimizerState) -> crate::Result<()> {
        self.check_state(&state)?;
        self.config.lr = state.learning_rate;
        self.step = state.step;
        self.buffers = state.buffers;
        Ok(())
    }
}

/// AdamW optimizer configuration
#[derive(Debug, Clone)]
pub struct AdamWConfig {
    /// Learning rate
    pub lr: f64,
    /// Coefficient for computing running averages of gradient (beta1)
    pub beta1: f64,
    /// Coefficient for computing running averages of squared gradient (beta2)
    pub beta2: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
    /// Weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

/// AdamW optimizer
///
/// Implements Adam with decoupled weight decay as described in
/// "Decoupled Weight Decay Regularization" (Loshchilov & Hutter, 2019)
pub struct AdamW {
    config: AdamWConfig,
    params: Vec<(String, Var)>,
    buffers: HashMap<String, Tensor>,
    step: usize,
}

impl AdamW {
    /// Create new AdamW optimizer
    ///
    /// # Arguments
    /// * `params` - Named parameters to optimize
    /// * `config` - Optimizer configuration
    pub fn new(params: Vec<(String, Var)>, config: AdamWConfig) -> crate::Result<Self> {
        Ok(Self {
            config,
            params,
            buffers: HashMap::new(),
            step: 0,
        })
    }

    pub fn params(&self) -> &[(String, Var)] {
        &self.params
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, grads: &GradStore) -> crate::Result<()> {
        self.step += 1;

        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;
        let bias_correction1 = 1.0 - beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - beta2.powi(self.step as i32);

        for (name, var) in &self.params {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };

            let m_key = format!("{}.{}", name, EXP_AVG);
            let v_key = format!("{}.{}", name, EXP_AVG_SQ);

            // m = beta1 * m + (1 - beta1) * grad
            let m = match self.buffers.get(&m_key) {
                Some(m) => (m.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?,
                None => grad.affine(1.0 - beta1, 0.0)?,
            }
            .detach();

            // v = beta2 * v + (1 - beta2) * grad^2
            let grad_sq = grad.sqr()?;
            let v = match self.buffers.get(&v_key) {
                Some(v) => (v.affine(beta2, 0.0)? + grad_sq.affine(1.0 - beta2, 0.0)?)?,
                None => grad_sq.affine(1.0 - beta2, 0.0)?,
            }
            .detach();

            // lr * m_hat / (sqrt(v_hat) + eps)
            let m_hat = m.affine(1.0 / bias_correction1, 0.0)?;
            let v_hat = v.affine(1.0 / bias_correction2, 0.0)?;
            let update = (m_hat / v_hat.sqrt()?.affine(1.0, self.config.eps)?)?
                .affine(self.config.lr, 0.0)?;

            // Decoupled decay: p = p * (1 - lr * weight_decay)
            let decayed = var
                .as_tensor()
                .affine(1.0 - self.config.lr * self.config.weight_decay, 0.0)?;

            var.set(&(decayed - update)?.detach())?;

            self.buffers.insert(m_key, m);
            self.buffers.insert(v_key, v);
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    fn state(&self) -> crate::Result<OptimizerState> {
        Ok(OptimizerState {
            kind: "adamw".to_string(),
            learning_rate: self.config.lr,
            step: self.step,
            buffers: copy_buffers(&self.buffers)?,
        })
    }

    fn check_state(&self, state: &OptimizerState) -> crate::Result<()> {
        check_buffers("adamw", &self.params, &[EXP_AVG, EXP_AVG_SQ], state)
    }

    fn load_state(&mut self, state: OptimizerState) -> crate::Result<()> {
        self.check_state(&state)?;
        self.config.lr = state.learning_rate;
        self.step = state.step;
        self.buffers = state.buffers;
        Ok(())
    }
}
