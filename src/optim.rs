use anyhow::{Context, Result};
use candle_core::Var;
use candle_core::backprop::GradStore;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

/// AdamW hyper-parameters persisted next to the weights. Moment estimates are
/// not saved; a resumed run rebuilds them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl From<&ParamsAdamW> for OptimizerState {
    fn from(params: &ParamsAdamW) -> Self {
        Self {
            lr: params.lr,
            beta1: params.beta1,
            beta2: params.beta2,
            eps: params.eps,
            weight_decay: params.weight_decay,
        }
    }
}

impl From<&OptimizerState> for ParamsAdamW {
    fn from(state: &OptimizerState) -> Self {
        Self {
            lr: state.lr,
            beta1: state.beta1,
            beta2: state.beta2,
            eps: state.eps,
            weight_decay: state.weight_decay,
        }
    }
}

pub fn adamw(vars: Vec<Var>, learning_rate: f64, weight_decay: f64) -> Result<AdamW> {
    let params = ParamsAdamW {
        lr: learning_rate,
        weight_decay,
        ..Default::default()
    };
    Ok(AdamW::new(vars, params)?)
}

pub fn save_optimizer<P: AsRef<Path>>(optimizer: &AdamW, path: P) -> Result<()> {
    let state = OptimizerState::from(optimizer.params());
    let file = File::create(path.as_ref())?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer(writer, &state)?;
    Ok(())
}

/// Restore hyper-parameters from `path`. A missing file leaves the optimizer
/// untouched.
pub fn load_optimizer<P: AsRef<Path>>(optimizer: &mut AdamW, path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(());
    }
    let file = File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let state: OptimizerState =
        serde_json::from_reader(reader).context("Failed to parse optimizer state")?;
    optimizer.set_params(ParamsAdamW::from(&state));
    Ok(())
}

/// Scale gradients so their global L2 norm is at most `max_norm`. Returns the
/// norm before clipping. A non-positive `max_norm` disables clipping.
pub fn clip_gradients(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total_norm_sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total_norm_sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let total_norm = total_norm_sq.sqrt();
    if max_norm > 0.0 && total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = (g * clip_coef)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Tensor};

    use super::*;

    #[test]
    fn clipping_rescales_to_max_norm() -> Result<()> {
        let var = Var::from_tensor(&Tensor::new(&[1.0f32, 1.0], &Device::Cpu)?)?;
        // d/dx sum(x * [3, 4]) = [3, 4], norm 5.
        let loss = var.as_tensor().mul(&Tensor::new(&[3.0f32, 4.0], &Device::Cpu)?)?.sum_all()?;
        let mut grads = loss.backward()?;
        let norm = clip_gradients(&mut grads, &[var.clone()], 1.0)?;
        assert!((norm - 5.0).abs() < 1e-5);
        let g = grads.get(var.as_tensor()).context("gradient")?.to_vec1::<f32>()?;
        assert!((g[0] - 0.6).abs() < 1e-4 && (g[1] - 0.8).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn small_gradients_are_left_alone() -> Result<()> {
        let var = Var::from_tensor(&Tensor::new(&[2.0f32], &Device::Cpu)?)?;
        let loss = var.as_tensor().affine(0.5, 0.0)?.sum_all()?;
        let mut grads = loss.backward()?;
        clip_gradients(&mut grads, &[var.clone()], 10.0)?;
        let g = grads.get(var.as_tensor()).context("gradient")?.to_vec1::<f32>()?;
        assert_eq!(g, vec![0.5]);
        Ok(())
    }

    #[test]
    fn optimizer_params_survive_a_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("optimizer.json");
        let var = Var::from_tensor(&Tensor::zeros(3, candle_core::DType::F32, &Device::Cpu)?)?;
        let mut opt = adamw(vec![var.clone()], 3e-4, 1e-5)?;
        opt.set_learning_rate(1e-3);
        save_optimizer(&opt, &path)?;

        let mut fresh = adamw(vec![var], 7e-4, 0.0)?;
        load_optimizer(&mut fresh, &path)?;
        assert_eq!(fresh.learning_rate(), 1e-3);
        assert_eq!(fresh.params().weight_decay, 1e-5);

        load_optimizer(&mut fresh, dir.path().join("missing.json"))?;
        assert_eq!(fresh.learning_rate(), 1e-3);
        Ok(())
    }
}
