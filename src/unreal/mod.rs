//! Single-threaded UNREAL trainer: A2C-style n-step actor-critic on the base
//! network plus pixel control, value replay and reward prediction drawn from
//! an experience history.

use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};
use candle_nn::{AdamW, Optimizer};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::checkpoint::TrainMeta;
use crate::device::with_autorelease_pool;
use crate::env::{Environment, Observation};
use crate::model::loss::{BaseBatch, LossInputs, PcBatch, RpBatch, VrBatch};
use crate::model::{
    ModelConfig, PC_MAP, RP_CLASSES, RP_FRAMES, UnrealModel, concat_action_and_reward,
};
use crate::optim::{adamw, clip_gradients, load_optimizer, save_optimizer};
use crate::training::{EpisodeStats, StepReport, Trainer};

pub mod experience;
pub mod pixel_change;

pub use experience::{ExperienceBuffer, ExperienceFrame};
pub use pixel_change::pixel_change;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnrealConfig {
    /// Maximum unroll length per update.
    pub local_t_max: usize,
    pub gamma: f64,
    /// Discount for the pixel-control Q targets.
    pub gamma_pc: f64,
    pub experience_history_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
}

impl Default for UnrealConfig {
    fn default() -> Self {
        Self {
            local_t_max: 20,
            gamma: 0.99,
            gamma_pc: 0.9,
            experience_history_size: 2000,
            learning_rate: 1e-4,
            weight_decay: 0.0,
            max_grad_norm: 40.0,
        }
    }
}

/// Sample an index from a probability vector.
pub fn choose_action(pi: &[f32], rng: &mut SmallRng) -> usize {
    let draw: f32 = rng.random();
    let mut cumulative = 0.0;
    for (i, p) in pi.iter().enumerate() {
        cumulative += p;
        if draw < cumulative {
            return i;
        }
    }
    pi.len().saturating_sub(1)
}

fn one_hot(index: usize, size: usize) -> Vec<f32> {
    let mut v = vec![0f32; size];
    v[index] = 1.0;
    v
}

/// Discounted returns computed backwards from `bootstrap`.
pub fn discounted_returns(rewards: &[f32], bootstrap: f32, gamma: f32) -> Vec<f32> {
    let mut returns = vec![0f32; rewards.len()];
    let mut r = bootstrap;
    for (i, reward) in rewards.iter().enumerate().rev() {
        r = reward + gamma * r;
        returns[i] = r;
    }
    returns
}

/// Reward class: zero, positive, negative.
fn reward_class(reward: f32) -> usize {
    if reward == 0.0 {
        0
    } else if reward > 0.0 {
        1
    } else {
        2
    }
}

/// Rollout collected by the base policy for one update.
struct Rollout {
    observations: Vec<Observation>,
    last_action_rewards: Vec<f32>,
    actions: Vec<f32>,
    rewards: Vec<f32>,
    values: Vec<f32>,
    bootstrap: f32,
}

pub struct UnrealTrainer {
    env: Box<dyn Environment>,
    model: UnrealModel,
    optimizer: AdamW,
    config: UnrealConfig,
    device: Device,
    experience: ExperienceBuffer,
    observation: Option<Observation>,
    last_action: Option<usize>,
    last_reward: f32,
    episode_reward: f64,
    episode_length: u64,
    total_env_steps: u64,
    /// Gradient updates applied.
    steps: u64,
    rng: SmallRng,
}

impl UnrealTrainer {
    pub fn new(
        env: Box<dyn Environment>,
        model_config: ModelConfig,
        config: UnrealConfig,
        device: &Device,
        seed: Option<u64>,
    ) -> Result<Self> {
        ensure!(
            model_config.action_space_size == env.action_count(),
            "model has {} actions but {} has {}",
            model_config.action_space_size,
            env.id(),
            env.action_count()
        );
        ensure!(
            !model_config.use_deepq_network,
            "the dueling head is trained by the DQN trainer, not the actor-critic one"
        );
        ensure!(config.local_t_max > 0, "local_t_max must be positive");
        ensure!(
            config.experience_history_size > config.local_t_max + 1,
            "experience_history_size must exceed local_t_max + 1"
        );

        let model = UnrealModel::new(model_config, device)?;
        let optimizer = adamw(model.variables(), config.learning_rate, config.weight_decay)?;
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };

        Ok(Self {
            env,
            model,
            optimizer,
            experience: ExperienceBuffer::new(config.experience_history_size),
            config,
            device: device.clone(),
            observation: None,
            last_action: None,
            last_reward: 0.0,
            episode_reward: 0.0,
            episode_length: 0,
            total_env_steps: 0,
            steps: 0,
            rng,
        })
    }

    pub fn config(&self) -> &UnrealConfig {
        &self.config
    }

    pub fn experience(&self) -> &ExperienceBuffer {
        &self.experience
    }

    fn action_size(&self) -> usize {
        self.model.action_size()
    }

    fn current_last_action_reward(&self) -> Vec<f32> {
        concat_action_and_reward(
            self.last_action,
            self.action_size(),
            self.last_reward.clamp(-1.0, 1.0),
        )
    }

    fn current_observation(&mut self) -> Result<Observation> {
        match self.observation.take() {
            Some(obs) => Ok(obs),
            None => self.env.reset(),
        }
    }

    /// Act once with the base policy and record the frame. Returns the action,
    /// its reward, the value estimate and the episode stats if it ended.
    fn act(&mut self, obs: Observation) -> Result<(usize, f32, f32, Option<EpisodeStats>)> {
        let lar = self.current_last_action_reward();
        let (pi, value) = self.model.run_base_policy_and_value(&obs, &lar)?;
        let action = choose_action(&pi, &mut self.rng);
        let result = self.env.step(action)?;
        let change = pixel_change::pixel_change(&obs.image, &result.observation.image)?;

        self.experience.add_frame(ExperienceFrame {
            observation: obs,
            action,
            reward: result.reward,
            terminal: result.done,
            pixel_change: change,
            last_action: self.last_action,
            last_reward: self.last_reward,
        });

        self.total_env_steps += 1;
        self.episode_reward += result.reward as f64;
        self.episode_length += 1;

        if result.done {
            let stats = EpisodeStats {
                reward: self.episode_reward,
                length: self.episode_length,
            };
            self.episode_reward = 0.0;
            self.episode_length = 0;
            self.last_action = None;
            self.last_reward = 0.0;
            self.observation = None;
            self.model.reset_state();
            Ok((action, result.reward, value, Some(stats)))
        } else {
            self.last_action = Some(action);
            self.last_reward = result.reward;
            self.observation = Some(result.observation);
            Ok((action, result.reward, value, None))
        }
    }

    /// Unroll up to `local_t_max` steps with the base policy.
    fn collect_rollout(&mut self) -> Result<(Rollout, Option<EpisodeStats>)> {
        let a = self.action_size();
        let mut rollout = Rollout {
            observations: Vec::with_capacity(self.config.local_t_max),
            last_action_rewards: Vec::with_capacity(self.config.local_t_max * (a + 1)),
            actions: Vec::with_capacity(self.config.local_t_max * a),
            rewards: Vec::with_capacity(self.config.local_t_max),
            values: Vec::with_capacity(self.config.local_t_max),
            bootstrap: 0.0,
        };

        let mut finished = None;
        for _ in 0..self.config.local_t_max {
            let obs = self.current_observation()?;
            rollout.observations.push(obs.clone());
            rollout
                .last_action_rewards
                .extend(self.current_last_action_reward());
            let (action, reward, value, episode) = self.act(obs)?;
            rollout.actions.extend(one_hot(action, a));
            rollout.rewards.push(reward);
            rollout.values.push(value);
            if episode.is_some() {
                finished = episode;
                break;
            }
        }

        if finished.is_none() {
            if let Some(next) = self.observation.as_ref() {
                let lar = self.current_last_action_reward();
                rollout.bootstrap = self.model.run_base_value(next, &lar)?;
            }
        }
        Ok((rollout, finished))
    }

    fn frames_tensor(&self, frames: &[&ExperienceFrame]) -> Result<(Tensor, Option<Tensor>)> {
        let observations: Vec<&Observation> = frames.iter().map(|f| &f.observation).collect();
        self.model.observation_batch(&observations)
    }

    fn lar_tensor(&self, rows: Vec<f32>, n: usize) -> Result<Tensor> {
        let width = self.model.config().last_action_reward_size();
        Ok(Tensor::from_vec(rows, (n, width), &self.device)?)
    }

    /// Split a sampled sequence into training frames and the bootstrap frame.
    /// A terminal last frame is trained on with a zero bootstrap.
    fn split_sequence<'a>(
        frames: &'a [&'a ExperienceFrame],
    ) -> (&'a [&'a ExperienceFrame], Option<&'a ExperienceFrame>) {
        match frames.split_last() {
            Some((last, _)) if last.terminal => (frames, None),
            Some((last, rest)) => (rest, Some(*last)),
            None => (frames, None),
        }
    }

    fn pc_batch(&mut self) -> Result<PcBatch> {
        let a = self.action_size();
        let sequence_size = self.config.local_t_max + 1;
        let frames = self.experience.sample_sequence(sequence_size, &mut self.rng)?;
        let (train, next) = Self::split_sequence(&frames);
        ensure!(!train.is_empty(), "pixel control sequence has no training frames");

        let mut pc_r: Vec<f32> = match next {
            Some(frame) => {
                let q_max = self
                    .model
                    .run_pc_q_max(&frame.observation, &frame.last_action_reward(a))?;
                q_max.into_iter().flatten().collect()
            }
            None => vec![0f32; PC_MAP * PC_MAP],
        };
        let gamma_pc = self.config.gamma_pc as f32;
        let mut returns = vec![0f32; train.len() * PC_MAP * PC_MAP];
        for (i, frame) in train.iter().enumerate().rev() {
            for (r, change) in pc_r.iter_mut().zip(&frame.pixel_change) {
                *r = change + gamma_pc * *r;
            }
            returns[i * PC_MAP * PC_MAP..(i + 1) * PC_MAP * PC_MAP].copy_from_slice(&pc_r);
        }

        let n = train.len();
        let (images, goals) = self.frames_tensor(train)?;
        let lar: Vec<f32> = train.iter().flat_map(|f| f.last_action_reward(a)).collect();
        let actions: Vec<f32> = train.iter().flat_map(|f| one_hot(f.action, a)).collect();
        Ok(PcBatch {
            images,
            goals,
            last_action_reward: Some(self.lar_tensor(lar, n)?),
            actions: Tensor::from_vec(actions, (n, a), &self.device)?,
            returns: Tensor::from_vec(returns, (n, PC_MAP, PC_MAP), &self.device)?,
        })
    }

    fn vr_batch(&mut self) -> Result<VrBatch> {
        let a = self.action_size();
        let sequence_size = self.config.local_t_max + 1;
        let frames = self.experience.sample_sequence(sequence_size, &mut self.rng)?;
        let (train, next) = Self::split_sequence(&frames);
        ensure!(!train.is_empty(), "value replay sequence has no training frames");

        let bootstrap = match next {
            Some(frame) => self
                .model
                .run_vr_value(&frame.observation, &frame.last_action_reward(a))?,
            None => 0.0,
        };
        let rewards: Vec<f32> = train.iter().map(|f| f.reward).collect();
        let returns = discounted_returns(&rewards, bootstrap, self.config.gamma as f32);

        let n = train.len();
        let (images, goals) = self.frames_tensor(train)?;
        let lar: Vec<f32> = train.iter().flat_map(|f| f.last_action_reward(a)).collect();
        Ok(VrBatch {
            images,
            goals,
            last_action_reward: Some(self.lar_tensor(lar, n)?),
            returns: Tensor::from_vec(returns, n, &self.device)?,
        })
    }

    fn rp_batch(&mut self) -> Result<RpBatch> {
        let frames = self.experience.sample_rp_sequence(&mut self.rng)?;
        let (history, label) = frames.split_at(RP_FRAMES);
        let (frames_tensor, goals) = self.frames_tensor(history)?;
        let target = one_hot(reward_class(label[0].reward), RP_CLASSES);
        Ok(RpBatch {
            frames: frames_tensor,
            goals,
            target: Tensor::from_vec(target, (1, RP_CLASSES), &self.device)?,
        })
    }

    /// One unroll plus one optimizer step on the combined objective.
    fn update(&mut self) -> Result<(u64, Option<EpisodeStats>, f32)> {
        let start_steps = self.total_env_steps;
        let start_state = self.model.lstm_state().cloned();
        let (rollout, finished) = self.collect_rollout()?;
        let n = rollout.rewards.len();

        let gamma = self.config.gamma as f32;
        let returns = discounted_returns(&rollout.rewards, rollout.bootstrap, gamma);
        let advantages: Vec<f32> = returns
            .iter()
            .zip(&rollout.values)
            .map(|(r, v)| r - v)
            .collect();

        let config = self.model.config().clone();
        let observations: Vec<&Observation> = rollout.observations.iter().collect();
        let (images, goals) = self.model.observation_batch(&observations)?;
        let a = self.action_size();
        let base = BaseBatch {
            images,
            goals,
            last_action_reward: Some(self.lar_tensor(rollout.last_action_rewards, n)?),
            initial_state: start_state,
            actions: Tensor::from_vec(rollout.actions, (n, a), &self.device)?,
            advantages: Tensor::from_vec(advantages, n, &self.device)?,
            returns: Tensor::from_vec(returns, n, &self.device)?,
        };

        let mut inputs = LossInputs {
            base: Some(base),
            ..Default::default()
        };
        if config.use_pixel_change {
            inputs.pc = Some(self.pc_batch()?);
        }
        if config.use_value_replay {
            inputs.vr = Some(self.vr_batch()?);
        }
        if config.use_reward_prediction {
            inputs.rp = Some(self.rp_batch()?);
        }

        let loss = with_autorelease_pool(|| {
            let loss = self.model.prepare_loss(&inputs)?;
            let mut grads = loss.total.backward()?;
            let vars = self.model.variables();
            let grad_norm = clip_gradients(&mut grads, &vars, self.config.max_grad_norm)?;
            self.optimizer.step(&grads)?;
            tracing::debug!(
                step = self.steps + 1,
                base = loss.base,
                pc = loss.pc,
                vr = loss.vr,
                rp = loss.rp,
                grad_norm,
                "unreal update"
            );
            loss.total_value()
        })?;
        self.steps += 1;

        Ok((self.total_env_steps - start_steps, finished, loss))
    }
}

impl Trainer for UnrealTrainer {
    /// Fills the experience history one frame at a time, then runs one
    /// unroll-and-update per call.
    fn step(&mut self) -> Result<StepReport> {
        if !self.experience.is_full() {
            let obs = self.current_observation()?;
            let (_, _, _, episode) = self.act(obs)?;
            if self.experience.is_full() {
                tracing::info!(frames = self.experience.len(), "experience history filled");
            }
            return Ok(StepReport {
                env_steps: 1,
                episode,
                loss: None,
                epsilon: 0.0,
            });
        }

        let (env_steps, episode, loss) = self.update()?;
        Ok(StepReport {
            env_steps,
            episode,
            loss: Some(loss),
            epsilon: 0.0,
        })
    }

    fn total_steps(&self) -> u64 {
        self.total_env_steps
    }

    fn agent_steps(&self) -> u64 {
        self.steps
    }

    fn epsilon(&self) -> f64 {
        0.0
    }

    fn model(&self) -> &UnrealModel {
        &self.model
    }

    fn save(&self, dir: &Path) -> Result<()> {
        self.model.save(dir.join("model.safetensors"))?;
        save_optimizer(&self.optimizer, dir.join("optimizer.json"))?;
        Ok(())
    }

    /// The experience history is not persisted; it refills after resuming.
    fn restore(&mut self, dir: &Path, meta: &TrainMeta) -> Result<()> {
        self.model.load(dir.join("model.safetensors"))?;
        if let Err(err) = load_optimizer(&mut self.optimizer, dir.join("optimizer.json")) {
            tracing::warn!(%err, "optimizer state load failed, continuing with fresh optimizer");
        }
        self.total_env_steps = meta.total_steps;
        self.steps = meta.agent_steps;
        self.observation = None;
        self.last_action = None;
        self.last_reward = 0.0;
        self.episode_reward = 0.0;
        self.episode_length = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;
    use crate::env::{CatchEnv, MazeEnv, TimeLimit};

    fn small_config() -> UnrealConfig {
        UnrealConfig {
            local_t_max: 5,
            experience_history_size: 12,
            ..Default::default()
        }
    }

    #[test]
    fn returns_discount_backwards_from_bootstrap() {
        let returns = discounted_returns(&[1.0, 0.0, 2.0], 10.0, 0.5);
        assert_eq!(returns, vec![2.0, 2.0, 7.0]);
    }

    #[test]
    fn choose_action_follows_the_distribution() {
        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..100 {
            assert_eq!(choose_action(&[0.0, 1.0, 0.0], &mut rng), 1);
        }
        let mut counts = [0usize; 2];
        for _ in 0..2000 {
            counts[choose_action(&[0.25, 0.75], &mut rng)] += 1;
        }
        assert!(counts[1] > counts[0] * 2, "{counts:?}");
    }

    #[test]
    fn reward_classes() {
        assert_eq!(reward_class(0.0), 0);
        assert_eq!(reward_class(0.3), 1);
        assert_eq!(reward_class(-1.0), 2);
    }

    #[test]
    fn history_fills_before_updates() -> Result<()> {
        let env = Box::new(CatchEnv::new(5, 2)?);
        let mut trainer =
            UnrealTrainer::new(env, ModelConfig::default(), small_config(), &Device::Cpu, Some(4))?;
        for _ in 0..12 {
            let report = trainer.step()?;
            assert!(report.loss.is_none());
            assert_eq!(report.env_steps, 1);
        }
        assert!(trainer.experience().is_full());

        let report = trainer.step()?;
        assert!(report.loss.is_some());
        assert!(report.env_steps >= 1 && report.env_steps <= 5);
        assert_eq!(trainer.agent_steps(), 1);
        assert_eq!(trainer.total_steps(), 12 + report.env_steps);
        Ok(())
    }

    #[test]
    fn every_auxiliary_head_trains_with_an_lstm() -> Result<()> {
        let env = Box::new(CatchEnv::new(5, 8)?);
        let model = ModelConfig {
            use_lstm: true,
            use_pixel_change: true,
            use_value_replay: true,
            use_reward_prediction: true,
            ..Default::default()
        };
        let mut trainer = UnrealTrainer::new(env, model, small_config(), &Device::Cpu, Some(9))?;
        let mut episodes = 0;
        let mut updates = 0;
        while updates < 3 {
            let report = trainer.step()?;
            if report.loss.is_some() {
                assert!(report.loss.is_some_and(f32::is_finite));
                updates += 1;
            }
            if let Some(stats) = report.episode {
                assert_eq!(stats.length, 4);
                episodes += 1;
            }
        }
        assert!(episodes >= 3);
        Ok(())
    }

    #[test]
    fn goal_conditioned_maze_trains() -> Result<()> {
        let env = Box::new(MazeEnv::new(3, 1)?);
        let model = ModelConfig {
            action_space_size: 4,
            use_goal_input: true,
            use_pixel_change: true,
            use_value_replay: true,
            ..Default::default()
        };
        let mut trainer = UnrealTrainer::new(env, model, small_config(), &Device::Cpu, Some(2))?;
        while trainer.agent_steps() < 2 {
            trainer.step()?;
        }
        Ok(())
    }

    #[test]
    fn time_limit_ends_the_unroll_like_a_terminal() -> Result<()> {
        let env = Box::new(TimeLimit::new(MazeEnv::new(5, 1)?, Some(3)));
        let model = ModelConfig {
            action_space_size: 4,
            use_lstm: true,
            ..Default::default()
        };
        let mut trainer = UnrealTrainer::new(env, model, small_config(), &Device::Cpu, Some(6))?;
        for _ in 0..2 {
            assert!(trainer.step()?.episode.is_none());
        }
        assert!(trainer.model().lstm_state().is_some());

        let stats = trainer.step()?.episode.context("time limit ends the episode")?;
        assert_eq!(stats.length, 3);
        assert!(trainer.observation.is_none());
        assert!(trainer.last_action.is_none());
        assert!(trainer.model().lstm_state().is_none());
        Ok(())
    }

    #[test]
    fn dueling_head_is_rejected() -> Result<()> {
        let env = Box::new(CatchEnv::new(5, 0)?);
        let model = ModelConfig {
            use_deepq_network: true,
            ..Default::default()
        };
        assert!(UnrealTrainer::new(env, model, small_config(), &Device::Cpu, None).is_err());
        Ok(())
    }

    #[test]
    fn save_and_restore_weights() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let env = Box::new(CatchEnv::new(5, 2)?);
        let mut trainer =
            UnrealTrainer::new(env, ModelConfig::default(), small_config(), &Device::Cpu, Some(4))?;
        while trainer.agent_steps() < 1 {
            trainer.step()?;
        }
        trainer.save(dir.path())?;

        let env = Box::new(CatchEnv::new(5, 2)?);
        let mut resumed =
            UnrealTrainer::new(env, ModelConfig::default(), small_config(), &Device::Cpu, Some(5))?;
        let meta = TrainMeta {
            best_reward: None,
            episode: 0,
            total_steps: trainer.total_steps(),
            epsilon: 0.0,
            agent_steps: 1,
        };
        resumed.restore(dir.path(), &meta)?;
        assert_eq!(resumed.total_steps(), trainer.total_steps());

        let probe = Observation::new(vec![0.4; crate::IMAGE_LEN]);
        let lar = concat_action_and_reward(None, 3, 0.0);
        assert_eq!(
            resumed.model().run_base_value(&probe, &lar)?,
            trainer.model().run_base_value(&probe, &lar)?
        );
        Ok(())
    }
}
