/// Parameter bookkeeping over candle `VarMap`s
use std::collections::HashMap;

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;

use crate::TrainError;

/// Named tensors, e.g. a parameter snapshot
pub type StateDict = HashMap<String, Tensor>;

/// All variables of a varmap with their names, sorted by name
///
/// The order is stable across instances built from the same code, unlike
/// `VarMap::all_vars`.
pub fn named_parameters(varmap: &VarMap) -> crate::Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| TrainError::Config(format!("VarMap lock poisoned: {}", e)))?;
    let mut params: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(params)
}

/// Deep copy of every parameter
pub fn state_dict(varmap: &VarMap) -> crate::Result<StateDict> {
    let mut state = HashMap::new();
    for (name, var) in named_parameters(varmap)? {
        state.insert(name, var.as_tensor().copy()?);
    }
    Ok(state)
}

/// Check that `state` has exactly the varmap's parameters with matching shapes
///
/// `section` prefixes key names in errors so a missing entry points at the
/// checkpoint field it came from.
pub fn check_state_dict(varmap: &VarMap, state: &StateDict, section: &str) -> crate::Result<()> {
    let params = named_parameters(varmap)?;

    for (name, var) in &params {
        let tensor = state
            .get(name)
            .ok_or_else(|| TrainError::MissingKey(format!("{}.{}", section, name)))?;
        if tensor.dims() != var.dims() {
            return Err(TrainError::Checkpoint(format!(
                "{}.{} has shape {:?}, expected {:?}",
                section,
                name,
                tensor.dims(),
                var.dims()
            )));
        }
    }

    if state.len() != params.len() {
        let mut unexpected: Vec<&String> = state
            .keys()
            .filter(|k| !params.iter().any(|(name, _)| name == *k))
            .collect();
        unexpected.sort();
        return Err(TrainError::Checkpoint(format!(
            "unexpected keys in {}: {:?}",
            section, unexpected
        )));
    }

    Ok(())
}

/// Overwrite every parameter in place from `state` (strict)
pub fn load_state_dict(varmap: &VarMap, state: &StateDict, section: &str) -> crate::Result<()> {
    check_state_dict(varmap, state, section)?;
    for (name, var) in named_parameters(varmap)? {
        if let Some(tensor) = state.get(&name) {
            let tensor = tensor.to_device(var.device())?.to_dtype(var.dtype())?;
            var.set(&tensor)?;
        }
    }
    Ok(())
}

/// Fail unless every parameter lives on `device`
pub fn ensure_device(varmap: &VarMap, device: &Device, owner: &str) -> crate::Result<()> {
    for (name, var) in named_parameters(varmap)? {
        if !var.device().same_device(device) {
            return Err(TrainError::Config(format!(
                "{} parameter `{}` is on {:?}, trainer runs on {:?}",
                owner,
                name,
                var.device(),
                device
            )));
        }
    }
    Ok(())
}

/// Total number of scalar parameters
pub fn count_parameters(varmap: &VarMap) -> usize {
    varmap
        .all_vars()
        .iter()
        .map(|v| v.dims().iter().product::<usize>())
        .sum()
}
