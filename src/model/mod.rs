use anyhow::{Context, Result, bail, ensure};
use candle_core::{D, DType, Device, IndexOp, Tensor, Var};
use candle_nn::rnn::LSTMState;
use candle_nn::{Conv2d, ConvTranspose2d, LSTM, LSTMConfig, Linear, Module, RNN, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::env::Observation;
use crate::{IMAGE_CHANNELS, IMAGE_SIZE};

pub mod layers;
pub mod loss;

pub const LSTM_SIZE: usize = 256;
/// Trunk output: 32 channels on a 9x9 map.
pub const CONV_CHANNELS: usize = 32;
pub const CONV_MAP: usize =
    layers::conv_output_size(layers::conv_output_size(IMAGE_SIZE, 8, 4), 4, 2);
pub const CONV_FEATURES: usize = CONV_CHANNELS * CONV_MAP * CONV_MAP;
/// Pixel-change prediction grid.
pub const PC_MAP: usize = layers::deconv_output_size(CONV_MAP, 4, 2);
pub const RP_FRAMES: usize = 3;
/// Reward classes: zero, positive, negative.
pub const RP_CLASSES: usize = 3;

// =============================================================================
// Network Options
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub action_space_size: usize,
    pub use_lstm: bool,
    pub use_pixel_change: bool,
    pub use_value_replay: bool,
    pub use_reward_prediction: bool,
    pub use_goal_input: bool,
    pub use_deepq_network: bool,
    pub pixel_change_lambda: f64,
    pub entropy_beta: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            action_space_size: 3,
            use_lstm: false,
            use_pixel_change: false,
            use_value_replay: false,
            use_reward_prediction: false,
            use_goal_input: false,
            use_deepq_network: false,
            pixel_change_lambda: 0.05,
            entropy_beta: 0.001,
        }
    }
}

impl ModelConfig {
    /// Width of the last-action one-hot plus last reward.
    pub fn last_action_reward_size(&self) -> usize {
        self.action_space_size + 1
    }
}

/// One-hot of the previous action followed by the previous reward.
pub fn concat_action_and_reward(action: Option<usize>, action_size: usize, reward: f32) -> Vec<f32> {
    let mut out = vec![0f32; action_size + 1];
    if let Some(a) = action {
        if a < action_size {
            out[a] = 1.0;
        }
    }
    out[action_size] = reward;
    out
}

// =============================================================================
// Graph Outputs
// =============================================================================

pub struct BaseOutput {
    /// Shared fc/LSTM features feeding the heads, `[N, 256]`.
    pub features: Tensor,
    pub pi_logits: Tensor,
    pub pi: Tensor,
    /// `[N]`
    pub v: Tensor,
    /// LSTM state after the last step of the unroll.
    pub lstm_state: Option<LSTMState>,
}

pub struct PcOutput {
    /// `[N, A, 20, 20]`
    pub q: Tensor,
    /// `[N, 20, 20]`
    pub q_max: Tensor,
}

struct PcHead {
    fc: Linear,
    deconv_v: ConvTranspose2d,
    deconv_a: ConvTranspose2d,
}

// =============================================================================
// UNREAL Network (candle)
// =============================================================================

/// UNREAL actor-critic network.
///
/// Every auxiliary head reads the same convolutional trunk and fc/LSTM layer;
/// the value-replay head also reuses the base value layer. The dueling DQN
/// head composes the policy logits (as advantages) with the base value.
pub struct UnrealModel {
    config: ModelConfig,
    varmap: VarMap,
    device: Device,
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    lstm: Option<LSTM>,
    policy: Linear,
    value: Linear,
    pc: Option<PcHead>,
    rp: Option<Linear>,
    lstm_state: Option<LSTMState>,
}

impl UnrealModel {
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        ensure!(config.action_space_size > 0, "action_space_size must be positive");
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let a = config.action_space_size;

        let conv_vb = vb.pp("base_conv");
        let conv1 = layers::conv(IMAGE_CHANNELS, 16, 8, 4, conv_vb.pp("base_conv1"))?;
        let conv2_in = if config.use_goal_input { 32 } else { 16 };
        let conv2 = layers::conv(conv2_in, CONV_CHANNELS, 4, 2, conv_vb.pp("base_conv2"))?;

        let (fc1, lstm) = if config.use_lstm {
            let lstm_vb = vb.pp("base_lstm");
            let fc1 = layers::fc(CONV_FEATURES, LSTM_SIZE, lstm_vb.pp("base_fc1"))?;
            let lstm = candle_nn::lstm(
                LSTM_SIZE + config.last_action_reward_size(),
                LSTM_SIZE,
                LSTMConfig::default(),
                lstm_vb.pp("cell"),
            )?;
            (fc1, Some(lstm))
        } else {
            let fc1 = layers::fc(CONV_FEATURES, LSTM_SIZE, vb.pp("base_fcn").pp("base_fc1"))?;
            (fc1, None)
        };

        let policy = layers::fc(LSTM_SIZE, a, vb.pp("base_policy").pp("base_fc_p"))?;
        let value = layers::fc(LSTM_SIZE, 1, vb.pp("base_value").pp("base_fc_v"))?;

        let pc = if config.use_pixel_change {
            let pc_vb = vb.pp("pc_deconv");
            Some(PcHead {
                fc: layers::fc(LSTM_SIZE, CONV_FEATURES, pc_vb.pp("pc_fc1"))?,
                deconv_v: layers::deconv(CONV_CHANNELS, 1, 4, 2, pc_vb.pp("pc_deconv_v"))?,
                deconv_a: layers::deconv(CONV_CHANNELS, a, 4, 2, pc_vb.pp("pc_deconv_a"))?,
            })
        } else {
            None
        };

        let rp = if config.use_reward_prediction {
            Some(layers::fc(
                CONV_FEATURES * RP_FRAMES,
                RP_CLASSES,
                vb.pp("rp_fc").pp("rp_fc1"),
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            varmap,
            device: device.clone(),
            conv1,
            conv2,
            fc1,
            lstm,
            policy,
            value,
            pc,
            rp,
            lstm_state: None,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn action_size(&self) -> usize {
        self.config.action_space_size
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn variables(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn lstm_state(&self) -> Option<&LSTMState> {
        self.lstm_state.as_ref()
    }

    // -------------------------------------------------------------------------
    // Shared layers
    // -------------------------------------------------------------------------

    /// `[N, 3, 84, 84]` (and optional goal frames) to `[N, 32, 9, 9]`.
    fn conv_trunk(&self, images: &Tensor, goals: Option<&Tensor>) -> Result<Tensor> {
        let h1 = self.conv1.forward(images)?.relu()?;
        let h1 = if self.config.use_goal_input {
            let goals = goals.context("goal input enabled but no goal frames supplied")?;
            let g1 = self.conv1.forward(goals)?.relu()?;
            Tensor::cat(&[&h1, &g1], 1)?
        } else {
            h1
        };
        Ok(self.conv2.forward(&h1)?.relu()?)
    }

    /// fc layer, then the LSTM when enabled. With an LSTM the batch is one
    /// time-ordered sequence starting from `initial_state` (zero if `None`).
    fn recurrent_features(
        &self,
        conv_output: &Tensor,
        last_action_reward: Option<&Tensor>,
        initial_state: Option<&LSTMState>,
    ) -> Result<(Tensor, Option<LSTMState>)> {
        let flat = conv_output.flatten_from(1)?;
        let fc = self.fc1.forward(&flat)?.relu()?;
        let Some(lstm) = self.lstm.as_ref() else {
            // The fc-only network ignores last action and reward.
            return Ok((fc, None));
        };

        let lar = last_action_reward.context("LSTM network requires last action/reward input")?;
        let steps = fc.dim(0)?;
        ensure!(steps > 0, "LSTM unroll needs at least one step");
        let lstm_input = Tensor::cat(&[&fc, lar], 1)?.unsqueeze(0)?;
        let init = match initial_state {
            Some(state) => state.clone(),
            None => lstm.zero_state(1)?,
        };
        let states = lstm.seq_init(&lstm_input, &init)?;
        let outputs = lstm.states_to_tensor(&states)?.squeeze(0)?;
        Ok((outputs, states.last().cloned()))
    }

    fn value_layer(&self, features: &Tensor) -> Result<Tensor> {
        Ok(self.value.forward(features)?.flatten_all()?)
    }

    fn pc_deconv(&self, features: &Tensor) -> Result<PcOutput> {
        let Some(pc) = self.pc.as_ref() else {
            bail!("pixel change head is disabled");
        };
        let h = pc.fc.forward(features)?.relu()?;
        let h = h.reshape(((), CONV_CHANNELS, CONV_MAP, CONV_MAP))?;
        let v = pc.deconv_v.forward(&h)?.relu()?;
        let a = pc.deconv_a.forward(&h)?.relu()?;
        let a_mean = a.mean_keepdim(1)?;
        let q = v.broadcast_add(&a.broadcast_sub(&a_mean)?)?;
        let q_max = q.max(1)?;
        Ok(PcOutput { q, q_max })
    }

    // -------------------------------------------------------------------------
    // Batched graphs
    // -------------------------------------------------------------------------

    pub fn base(
        &self,
        images: &Tensor,
        goals: Option<&Tensor>,
        last_action_reward: Option<&Tensor>,
        initial_state: Option<&LSTMState>,
    ) -> Result<BaseOutput> {
        let conv = self.conv_trunk(images, goals)?;
        let (features, lstm_state) =
            self.recurrent_features(&conv, last_action_reward, initial_state)?;
        let pi_logits = self.policy.forward(&features)?;
        let pi = candle_nn::ops::softmax_last_dim(&pi_logits)?;
        let v = self.value_layer(&features)?;
        Ok(BaseOutput {
            features,
            pi_logits,
            pi,
            v,
            lstm_state,
        })
    }

    /// Pixel-change Q maps. The LSTM (if any) always starts from zero.
    pub fn pc(
        &self,
        images: &Tensor,
        goals: Option<&Tensor>,
        last_action_reward: Option<&Tensor>,
    ) -> Result<PcOutput> {
        ensure!(self.pc.is_some(), "pixel change head is disabled");
        let conv = self.conv_trunk(images, goals)?;
        let (features, _) = self.recurrent_features(&conv, last_action_reward, None)?;
        self.pc_deconv(&features)
    }

    /// Value-replay values through the shared value layer, `[N]`.
    pub fn vr(
        &self,
        images: &Tensor,
        goals: Option<&Tensor>,
        last_action_reward: Option<&Tensor>,
    ) -> Result<Tensor> {
        ensure!(self.config.use_value_replay, "value replay head is disabled");
        let conv = self.conv_trunk(images, goals)?;
        let (features, _) = self.recurrent_features(&conv, last_action_reward, None)?;
        self.value_layer(&features)
    }

    /// Reward-class probabilities for `N` stacks of 3 frames given as
    /// `[N*3, 3, 84, 84]`, frame-major within each stack. Returns `[N, 3]`.
    pub fn rp(&self, frames: &Tensor, goals: Option<&Tensor>) -> Result<Tensor> {
        let Some(rp) = self.rp.as_ref() else {
            bail!("reward prediction head is disabled");
        };
        let total = frames.dim(0)?;
        ensure!(
            total > 0 && total % RP_FRAMES == 0,
            "reward prediction expects a multiple of {RP_FRAMES} frames, got {total}"
        );
        let conv = self.conv_trunk(frames, goals)?;
        let stacked = conv.reshape((total / RP_FRAMES, CONV_FEATURES * RP_FRAMES))?;
        let logits = rp.forward(&stacked)?;
        Ok(candle_nn::ops::softmax_last_dim(&logits)?)
    }

    /// Dueling Q-values `[N, A]`: `V + (A - mean(A))`, with the policy logits
    /// standing in as advantages.
    pub fn deepq(
        &self,
        images: &Tensor,
        goals: Option<&Tensor>,
        last_action_reward: Option<&Tensor>,
    ) -> Result<Tensor> {
        ensure!(self.config.use_deepq_network, "deepq head is disabled");
        let base = self.base(images, goals, last_action_reward, None)?;
        Ok(dueling_q(&base.v, &base.pi_logits)?)
    }

    // -------------------------------------------------------------------------
    // Single-observation helpers
    // -------------------------------------------------------------------------

    /// Stack observations into image (and goal) batches on this model's device.
    pub fn observation_batch(
        &self,
        observations: &[&Observation],
    ) -> Result<(Tensor, Option<Tensor>)> {
        stack_observations(observations, self.config.use_goal_input, &self.device)
    }

    fn last_action_reward_tensor(&self, last_action_reward: &[f32]) -> Result<Tensor> {
        let width = self.config.last_action_reward_size();
        ensure!(
            last_action_reward.len() == width,
            "last action/reward must have {width} entries, got {}",
            last_action_reward.len()
        );
        Ok(Tensor::from_slice(last_action_reward, (1, width), &self.device)?)
    }

    pub fn reset_state(&mut self) {
        self.lstm_state = None;
    }

    /// Policy and value for one step. Advances the LSTM state.
    pub fn run_base_policy_and_value(
        &mut self,
        obs: &Observation,
        last_action_reward: &[f32],
    ) -> Result<(Vec<f32>, f32)> {
        let (images, goals) = self.observation_batch(&[obs])?;
        let lar = self.last_action_reward_tensor(last_action_reward)?;
        let out = self.base(&images, goals.as_ref(), Some(&lar), self.lstm_state.as_ref())?;
        self.lstm_state = out.lstm_state;
        let pi = out.pi.i(0)?.to_vec1::<f32>()?;
        let v = out.v.i(0)?.to_scalar::<f32>()?;
        Ok((pi, v))
    }

    /// Policy, value and pixel-change Q maps `[A][20][20]` for display.
    /// Advances the LSTM state.
    pub fn run_base_policy_value_pc_q(
        &mut self,
        obs: &Observation,
        last_action_reward: &[f32],
    ) -> Result<(Vec<f32>, f32, Vec<Vec<Vec<f32>>>)> {
        ensure!(self.pc.is_some(), "pixel change head is disabled");
        let (images, goals) = self.observation_batch(&[obs])?;
        let lar = self.last_action_reward_tensor(last_action_reward)?;
        let out = self.base(&images, goals.as_ref(), Some(&lar), self.lstm_state.as_ref())?;
        let pc = self.pc_deconv(&out.features)?;
        self.lstm_state = out.lstm_state;
        let pi = out.pi.i(0)?.to_vec1::<f32>()?;
        let v = out.v.i(0)?.to_scalar::<f32>()?;
        let q = pc.q.i(0)?.to_vec3::<f32>()?;
        Ok((pi, v, q))
    }

    /// Value used to bootstrap the end of an unroll. Leaves the LSTM state
    /// untouched: the next unroll recomputes this step with updated weights.
    pub fn run_base_value(&self, obs: &Observation, last_action_reward: &[f32]) -> Result<f32> {
        let (images, goals) = self.observation_batch(&[obs])?;
        let lar = self.last_action_reward_tensor(last_action_reward)?;
        let out = self.base(&images, goals.as_ref(), Some(&lar), self.lstm_state.as_ref())?;
        Ok(out.v.i(0)?.to_scalar::<f32>()?)
    }

    pub fn run_pc_q_max(
        &self,
        obs: &Observation,
        last_action_reward: &[f32],
    ) -> Result<Vec<Vec<f32>>> {
        let (images, goals) = self.observation_batch(&[obs])?;
        let lar = self.last_action_reward_tensor(last_action_reward)?;
        let out = self.pc(&images, goals.as_ref(), Some(&lar))?;
        Ok(out.q_max.i(0)?.to_vec2::<f32>()?)
    }

    pub fn run_vr_value(&self, obs: &Observation, last_action_reward: &[f32]) -> Result<f32> {
        let (images, goals) = self.observation_batch(&[obs])?;
        let lar = self.last_action_reward_tensor(last_action_reward)?;
        let v = self.vr(&images, goals.as_ref(), Some(&lar))?;
        Ok(v.i(0)?.to_scalar::<f32>()?)
    }

    /// Reward-class probabilities (zero, positive, negative) from 3 frames.
    pub fn run_rp_c(&self, history: &[&Observation]) -> Result<Vec<f32>> {
        ensure!(
            history.len() == RP_FRAMES,
            "reward prediction takes {RP_FRAMES} frames, got {}",
            history.len()
        );
        let (frames, goals) = self.observation_batch(history)?;
        let c = self.rp(&frames, goals.as_ref())?;
        Ok(c.i(0)?.to_vec1::<f32>()?)
    }

    /// Q-values `[A]` for one observation.
    pub fn q_values(&self, obs: &Observation) -> Result<Vec<f32>> {
        let (images, goals) = self.observation_batch(&[obs])?;
        let lar = self.zero_last_action_reward(1)?;
        let q = self.deepq(&images, goals.as_ref(), lar.as_ref())?;
        Ok(q.i(0)?.to_vec1::<f32>()?)
    }

    /// Greedy action under the dueling head.
    pub fn predict(&self, obs: &Observation) -> Result<usize> {
        let (images, goals) = self.observation_batch(&[obs])?;
        let lar = self.zero_last_action_reward(1)?;
        let q = self.deepq(&images, goals.as_ref(), lar.as_ref())?;
        let action = q.argmax(D::Minus1)?.i(0)?.to_scalar::<u32>()?;
        Ok(action as usize)
    }

    /// Zero last-action/reward rows for LSTM networks fed without history.
    pub fn zero_last_action_reward(&self, rows: usize) -> Result<Option<Tensor>> {
        if !self.config.use_lstm {
            return Ok(None);
        }
        let width = self.config.last_action_reward_size();
        Ok(Some(Tensor::zeros((rows, width), DType::F32, &self.device)?))
    }

    // -------------------------------------------------------------------------
    // Weights
    // -------------------------------------------------------------------------

    /// Copy every variable from `src` by name.
    pub fn sync_from(&mut self, src: &UnrealModel) -> Result<()> {
        let src_data = src
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock source varmap for sync"))?;
        let mut dst_data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock destination varmap for sync"))?;
        for (name, dst_v) in dst_data.iter_mut() {
            let src_v = src_data
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("Missing var {name} in source model during sync"))?;
            dst_v.set(&src_v.as_tensor().detach())?;
        }
        Ok(())
    }

    /// Polyak averaging: `self = tau * src + (1 - tau) * self`.
    pub fn soft_update_from(&mut self, src: &UnrealModel, tau: f64) -> Result<()> {
        let src_data = src
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock source varmap for soft update"))?;
        let mut dst_data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Failed to lock destination varmap for soft update"))?;
        for (name, dst_v) in dst_data.iter_mut() {
            let src_v = src_data.get(name).ok_or_else(|| {
                anyhow::anyhow!("Missing var {name} in source model during soft update")
            })?;
            let blended = src_v
                .as_tensor()
                .affine(tau, 0.0)?
                .add(&dst_v.as_tensor().affine(1.0 - tau, 0.0)?)?;
            dst_v.set(&blended.detach())?;
        }
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .save(path)
            .with_context(|| format!("Failed to save model to {}", path.display()))?;
        tracing::debug!(path = %path.display(), "model saved");
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .load(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;
        self.reset_state();
        tracing::debug!(path = %path.display(), "model loaded");
        Ok(())
    }
}

/// `Q = V[:, None] + (A - mean(A))`
pub fn dueling_q(value: &Tensor, advantage: &Tensor) -> candle_core::Result<Tensor> {
    let value = value.reshape(((), 1))?;
    let centred = advantage.broadcast_sub(&advantage.mean_keepdim(1)?)?;
    value.broadcast_add(&centred)
}

/// Stack observation frames into `[N, 3, 84, 84]` tensors.
pub fn stack_observations(
    observations: &[&Observation],
    with_goals: bool,
    device: &Device,
) -> Result<(Tensor, Option<Tensor>)> {
    ensure!(!observations.is_empty(), "cannot stack an empty observation batch");
    let n = observations.len();
    let shape = (n, IMAGE_CHANNELS, IMAGE_SIZE, IMAGE_SIZE);
    let mut images = Vec::with_capacity(n * crate::IMAGE_LEN);
    for obs in observations {
        ensure!(
            obs.image.len() == crate::IMAGE_LEN,
            "observation frame has {} values, expected {}",
            obs.image.len(),
            crate::IMAGE_LEN
        );
        images.extend_from_slice(&obs.image);
    }
    let images = Tensor::from_vec(images, shape, device)?;
    if !with_goals {
        return Ok((images, None));
    }
    let mut goals = Vec::with_capacity(n * crate::IMAGE_LEN);
    for obs in observations {
        let goal = obs
            .goal
            .as_ref()
            .context("goal input enabled but observation has no goal frame")?;
        ensure!(goal.len() == crate::IMAGE_LEN, "goal frame has wrong size");
        goals.extend_from_slice(goal);
    }
    Ok((images, Some(Tensor::from_vec(goals, shape, device)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(value: f32) -> Observation {
        Observation::new(vec![value; crate::IMAGE_LEN])
    }

    fn goal_obs(value: f32) -> Observation {
        Observation::with_goal(vec![value; crate::IMAGE_LEN], vec![1.0 - value; crate::IMAGE_LEN])
    }

    fn full_config() -> ModelConfig {
        ModelConfig {
            action_space_size: 4,
            use_lstm: true,
            use_pixel_change: true,
            use_value_replay: true,
            use_reward_prediction: true,
            ..Default::default()
        }
    }

    #[test]
    fn base_network_shapes() -> Result<()> {
        let mut model = UnrealModel::new(ModelConfig::default(), &Device::Cpu)?;
        let lar = concat_action_and_reward(Some(1), 3, 0.5);
        let (pi, _v) = model.run_base_policy_and_value(&blank(0.3), &lar)?;
        assert_eq!(pi.len(), 3);
        assert!((pi.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(model.lstm_state().is_none());
        Ok(())
    }

    #[test]
    fn lstm_state_advances_only_on_policy_runs() -> Result<()> {
        let mut model = UnrealModel::new(full_config(), &Device::Cpu)?;
        let lar = concat_action_and_reward(None, 4, 0.0);
        let obs = blank(0.5);

        let v0 = model.run_base_value(&obs, &lar)?;
        assert!(model.lstm_state().is_none());
        assert_eq!(v0, model.run_base_value(&obs, &lar)?);

        model.run_base_policy_and_value(&obs, &lar)?;
        let state = model.lstm_state().context("state after policy run")?;
        assert_eq!(state.h().dims(), &[1, LSTM_SIZE]);

        model.reset_state();
        assert!(model.lstm_state().is_none());
        assert_eq!(v0, model.run_base_value(&obs, &lar)?);
        Ok(())
    }

    #[test]
    fn lstm_requires_last_action_reward() -> Result<()> {
        let model = UnrealModel::new(full_config(), &Device::Cpu)?;
        let (images, _) = model.observation_batch(&[&blank(0.1)])?;
        assert!(model.base(&images, None, None, None).is_err());
        let obs = blank(0.1);
        assert!(model.run_base_value(&obs, &[0.0; 2]).is_err());
        Ok(())
    }

    #[test]
    fn auxiliary_heads_have_expected_shapes() -> Result<()> {
        let mut model = UnrealModel::new(full_config(), &Device::Cpu)?;
        let lar = concat_action_and_reward(Some(0), 4, 1.0);
        let obs = blank(0.2);

        let q_max = model.run_pc_q_max(&obs, &lar)?;
        assert_eq!(q_max.len(), PC_MAP);
        assert!(q_max.iter().all(|row| row.len() == PC_MAP));

        let (pi, _, q) = model.run_base_policy_value_pc_q(&obs, &lar)?;
        assert_eq!(pi.len(), 4);
        assert_eq!(q.len(), 4);
        assert_eq!(q[0].len(), PC_MAP);
        assert!(model.lstm_state().is_some());

        model.run_vr_value(&obs, &lar)?;

        let (a, b, c) = (blank(0.1), blank(0.2), blank(0.3));
        let rp = model.run_rp_c(&[&a, &b, &c])?;
        assert_eq!(rp.len(), RP_CLASSES);
        assert!((rp.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(model.run_rp_c(&[&a, &b]).is_err());
        Ok(())
    }

    #[test]
    fn batched_unroll_matches_stepwise_policy_runs() -> Result<()> {
        let mut model = UnrealModel::new(full_config(), &Device::Cpu)?;
        let warmup = concat_action_and_reward(None, 4, 0.0);
        model.run_base_policy_and_value(&blank(0.9), &warmup)?;
        let start = model.lstm_state().cloned();

        let observations = [blank(0.1), blank(0.5), blank(0.8)];
        let lars = [
            concat_action_and_reward(Some(2), 4, 0.0),
            concat_action_and_reward(Some(0), 4, 1.0),
            concat_action_and_reward(Some(3), 4, -0.5),
        ];
        let mut stepwise = Vec::new();
        for (obs, lar) in observations.iter().zip(&lars) {
            stepwise.push(model.run_base_policy_and_value(obs, lar)?);
        }

        let refs: Vec<&Observation> = observations.iter().collect();
        let (images, goals) = model.observation_batch(&refs)?;
        let lar = Tensor::from_vec(lars.concat(), (3, 5), &Device::Cpu)?;
        let out = model.base(&images, goals.as_ref(), Some(&lar), start.as_ref())?;
        let pi = out.pi.to_vec2::<f32>()?;
        let v = out.v.to_vec1::<f32>()?;

        for (t, (step_pi, step_v)) in stepwise.iter().enumerate() {
            assert!((v[t] - step_v).abs() < 1e-5, "value differs at step {t}");
            for (a, b) in pi[t].iter().zip(step_pi) {
                assert!((a - b).abs() < 1e-5, "policy differs at step {t}");
            }
        }
        let batched_h = out.lstm_state.context("batched unroll state")?.h().to_vec2::<f32>()?;
        let stepwise_h = model.lstm_state().context("stepwise state")?.h().to_vec2::<f32>()?;
        for (a, b) in batched_h[0].iter().zip(&stepwise_h[0]) {
            assert!((a - b).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn reward_prediction_batches_stacks_of_three() -> Result<()> {
        let model = UnrealModel::new(full_config(), &Device::Cpu)?;
        let frames: Vec<Observation> = (0..6).map(|i| blank(i as f32 / 6.0)).collect();
        let refs: Vec<&Observation> = frames.iter().collect();
        let (images, goals) = model.observation_batch(&refs)?;
        let c = model.rp(&images, goals.as_ref())?;
        assert_eq!(c.dims(), &[2, RP_CLASSES]);
        for row in c.to_vec2::<f32>()? {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn pc_q_is_dueling_and_q_max_is_the_channel_max() -> Result<()> {
        let model = UnrealModel::new(
            ModelConfig {
                use_pixel_change: true,
                ..Default::default()
            },
            &Device::Cpu,
        )?;
        let (images, _) = model.observation_batch(&[&blank(0.4), &blank(0.9)])?;
        let out = model.pc(&images, None, None)?;
        assert_eq!(out.q.dims(), &[2, 3, PC_MAP, PC_MAP]);
        assert_eq!(out.q_max.dims(), &[2, PC_MAP, PC_MAP]);
        let q_max = out.q_max.to_vec3::<f32>()?;
        let expected = out.q.max(1)?.to_vec3::<f32>()?;
        assert_eq!(q_max, expected);
        Ok(())
    }

    #[test]
    fn disabled_heads_error() -> Result<()> {
        let mut model = UnrealModel::new(ModelConfig::default(), &Device::Cpu)?;
        let lar = concat_action_and_reward(None, 3, 0.0);
        let obs = blank(0.0);
        assert!(model.run_pc_q_max(&obs, &lar).is_err());
        assert!(model.run_base_policy_value_pc_q(&obs, &lar).is_err());
        assert!(model.run_vr_value(&obs, &lar).is_err());
        assert!(model.run_rp_c(&[&obs, &obs, &obs]).is_err());
        assert!(model.q_values(&obs).is_err());
        Ok(())
    }

    #[test]
    fn dueling_head_centres_advantages() -> Result<()> {
        let v = Tensor::new(&[2.0f32, -1.0], &Device::Cpu)?;
        let adv = Tensor::new(&[[1.0f32, 2.0, 3.0], [0.0, 0.0, 3.0]], &Device::Cpu)?;
        let q = dueling_q(&v, &adv)?.to_vec2::<f32>()?;
        assert_eq!(q, vec![vec![1.0, 2.0, 3.0], vec![-2.0, -2.0, 1.0]]);
        Ok(())
    }

    #[test]
    fn deepq_prediction_is_argmax_of_q() -> Result<()> {
        let model = UnrealModel::new(
            ModelConfig {
                use_deepq_network: true,
                ..Default::default()
            },
            &Device::Cpu,
        )?;
        let obs = blank(0.7);
        let q = model.q_values(&obs)?;
        let best = q
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .context("q has entries")?;
        assert_eq!(model.predict(&obs)?, best);
        Ok(())
    }

    #[test]
    fn goal_input_shares_first_conv_layer() -> Result<()> {
        let mut model = UnrealModel::new(
            ModelConfig {
                action_space_size: 4,
                use_goal_input: true,
                ..Default::default()
            },
            &Device::Cpu,
        )?;
        let names: Vec<String> = model
            .varmap()
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("lock failed"))?
            .keys()
            .cloned()
            .collect();
        assert!(names.iter().any(|n| n == "base_conv.base_conv1.weight"));
        assert_eq!(names.iter().filter(|n| n.contains("conv1")).count(), 2);

        let lar = concat_action_and_reward(None, 4, 0.0);
        assert!(model.run_base_policy_and_value(&blank(0.1), &lar).is_err());
        model.run_base_policy_and_value(&goal_obs(0.1), &lar)?;
        Ok(())
    }

    #[test]
    fn sync_copies_all_weights() -> Result<()> {
        let config = ModelConfig {
            use_deepq_network: true,
            ..Default::default()
        };
        let src = UnrealModel::new(config.clone(), &Device::Cpu)?;
        let mut dst = UnrealModel::new(config, &Device::Cpu)?;
        let obs = blank(0.6);
        assert_ne!(src.q_values(&obs)?, dst.q_values(&obs)?);
        dst.sync_from(&src)?;
        assert_eq!(src.q_values(&obs)?, dst.q_values(&obs)?);
        Ok(())
    }

    #[test]
    fn soft_update_with_tau_one_is_a_copy() -> Result<()> {
        let config = ModelConfig {
            use_deepq_network: true,
            ..Default::default()
        };
        let src = UnrealModel::new(config.clone(), &Device::Cpu)?;
        let mut dst = UnrealModel::new(config, &Device::Cpu)?;
        dst.soft_update_from(&src, 1.0)?;
        let obs = blank(0.25);
        let (a, b) = (src.q_values(&obs)?, dst.q_values(&obs)?);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn mismatched_models_refuse_to_sync() -> Result<()> {
        let src = UnrealModel::new(ModelConfig::default(), &Device::Cpu)?;
        let mut dst = UnrealModel::new(
            ModelConfig {
                use_pixel_change: true,
                ..Default::default()
            },
            &Device::Cpu,
        )?;
        assert!(dst.sync_from(&src).is_err());
        Ok(())
    }
}
