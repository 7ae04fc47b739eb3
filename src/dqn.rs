use anyhow::{Result, ensure};
use candle_core::{D, DType, Device};
use candle_nn::{AdamW, Optimizer};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::checkpoint::TrainMeta;
use crate::device::with_autorelease_pool;
use crate::env::{Environment, Observation};
use crate::model::loss::{DeepQBatch, LossInputs};
use crate::model::{ModelConfig, UnrealModel};
use crate::optim::{adamw, clip_gradients, load_optimizer, save_optimizer};
use crate::replay::{ReplayBuffer, Transition};
use crate::training::{EpisodeStats, StepReport, Trainer};

// =============================================================================
// Agent Hyperparameters
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepQConfig {
    /// Environment steps over which epsilon decays linearly.
    pub annealing_steps: u64,
    pub epsilon_start: f64,
    pub epsilon_end: f64,
    pub gamma: f64,
    /// Polyak factor for the target network; 0 switches to hard copies every
    /// `target_update` gradient steps.
    pub tau: f64,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub max_grad_norm: f64,
    pub replay_capacity: usize,
    pub batch_size: usize,
    pub learn_start: usize,
    pub train_freq: u64,
    pub target_update: u64,
}

impl Default for DeepQConfig {
    fn default() -> Self {
        Self {
            annealing_steps: 100_000,
            epsilon_start: 1.0,
            epsilon_end: 0.02,
            gamma: 0.99,
            tau: 0.005,
            learning_rate: 1e-4,
            weight_decay: 1e-5,
            max_grad_norm: 10.0,
            replay_capacity: 50_000,
            batch_size: 32,
            learn_start: 1_000,
            train_freq: 4,
            target_update: 1_000,
        }
    }
}

impl DeepQConfig {
    pub fn epsilon_at(&self, env_steps: u64) -> f64 {
        if self.annealing_steps == 0 {
            return self.epsilon_end;
        }
        let progress = (env_steps as f64 / self.annealing_steps as f64).min(1.0);
        self.epsilon_start + (self.epsilon_end - self.epsilon_start) * progress
    }
}

// =============================================================================
// DQN Trainer
// =============================================================================

/// Double DQN on the dueling head of an [`UnrealModel`].
pub struct DeepQTrainer {
    env: Box<dyn Environment>,
    online: UnrealModel,
    target: UnrealModel,
    optimizer: AdamW,
    config: DeepQConfig,
    device: Device,
    pub replay: ReplayBuffer,
    pub epsilon: f64,
    observation: Option<Observation>,
    episode_reward: f64,
    episode_length: u64,
    pub total_env_steps: u64,
    /// Gradient steps taken.
    pub steps: u64,
    rng: SmallRng,
}

impl DeepQTrainer {
    pub fn new(
        env: Box<dyn Environment>,
        model_config: ModelConfig,
        config: DeepQConfig,
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
            !model_config.use_lstm,
            "the DQN trainer samples uncorrelated transitions and cannot drive an LSTM"
        );
        ensure!(config.batch_size > 0, "batch_size must be positive");
        ensure!(config.train_freq > 0, "train_freq must be positive");
        ensure!(
            config.tau > 0.0 || config.target_update > 0,
            "target_update must be positive when tau is 0"
        );

        let model_config = ModelConfig {
            use_deepq_network: true,
            ..model_config
        };
        let online = UnrealModel::new(model_config.clone(), device)?;
        let mut target = UnrealModel::new(model_config, device)?;
        target.sync_from(&online)?;

        let optimizer = adamw(online.variables(), config.learning_rate, config.weight_decay)?;
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };

        Ok(Self {
            env,
            online,
            target,
            optimizer,
            epsilon: config.epsilon_at(0),
            replay: ReplayBuffer::new(config.replay_capacity),
            config,
            device: device.clone(),
            observation: None,
            episode_reward: 0.0,
            episode_length: 0,
            total_env_steps: 0,
            steps: 0,
            rng,
        })
    }

    pub fn config(&self) -> &DeepQConfig {
        &self.config
    }

    pub fn env(&self) -> &dyn Environment {
        self.env.as_ref()
    }

    pub fn target(&self) -> &UnrealModel {
        &self.target
    }

    /// Select action using epsilon-greedy
    pub fn select_action(&mut self, obs: &Observation) -> Result<usize> {
        if self.rng.random::<f64>() < self.epsilon {
            Ok(self.rng.random_range(0..self.online.action_size()))
        } else {
            self.online.predict(obs)
        }
    }

    pub fn remember(&mut self, t: Transition) {
        self.replay.push(t);
    }

    fn ready_to_learn(&self) -> bool {
        let warm = self.replay.len() >= self.config.learn_start.max(self.config.batch_size);
        warm && self.total_env_steps.is_multiple_of(self.config.train_freq)
    }

    /// One Double DQN update from the replay buffer. `None` until the buffer
    /// holds `learn_start` transitions and on steps between `train_freq`.
    pub fn train_step(&mut self) -> Result<Option<f32>> {
        if !self.ready_to_learn() {
            return Ok(None);
        }
        with_autorelease_pool(|| {
            let use_goals = self.online.config().use_goal_input;
            let batch = self.replay.sample(
                self.config.batch_size,
                use_goals,
                &self.device,
                &mut self.rng,
            )?;

            // Online net selects the next action, target net evaluates it.
            let next_goals = batch.next_goals.as_ref();
            let next_q_online = self.online.deepq(&batch.next_states, next_goals, None)?;
            let best_next_actions = next_q_online.argmax(D::Minus1)?.unsqueeze(1)?;
            let next_q_target = self.target.deepq(&batch.next_states, next_goals, None)?;
            let next_q = next_q_target
                .gather(&best_next_actions.to_dtype(DType::I64)?, 1)?
                .squeeze(1)?;

            // r + gamma * Q_target(s', argmax_a Q_online(s', a)) * (1 - done)
            let discounted = next_q.affine(self.config.gamma, 0.0)?;
            let target_q = batch.rewards.add(&discounted.mul(&batch.not_dones)?)?.detach();

            let inputs = LossInputs {
                deepq: Some(DeepQBatch {
                    images: batch.states,
                    goals: batch.goals,
                    actions: batch.actions,
                    target_q,
                }),
                ..Default::default()
            };
            let loss = self.online.prepare_loss(&inputs)?;

            let mut grads = loss.total.backward()?;
            let vars = self.online.variables();
            let grad_norm = clip_gradients(&mut grads, &vars, self.config.max_grad_norm)?;
            self.optimizer.step(&grads)?;
            self.steps += 1;

            if self.config.tau > 0.0 {
                self.target.soft_update_from(&self.online, self.config.tau)?;
            } else if self.steps.is_multiple_of(self.config.target_update) {
                self.target.sync_from(&self.online)?;
            }

            let value = loss.total_value()?;
            tracing::debug!(step = self.steps, loss = value, grad_norm, "dqn update");
            Ok(Some(value))
        })
    }
}

impl Trainer for DeepQTrainer {
    fn step(&mut self) -> Result<StepReport> {
        let obs = match self.observation.take() {
            Some(obs) => obs,
            None => self.env.reset()?,
        };

        let action = self.select_action(&obs)?;
        let result = self.env.step(action)?;

        // Truncated episodes still bootstrap from the next state.
        let terminal = result.done && !result.truncated;
        self.remember(Transition {
            observation: obs,
            action,
            reward: result.reward,
            next_observation: result.observation.clone(),
            done: terminal,
        });

        self.total_env_steps += 1;
        self.episode_reward += result.reward as f64;
        self.episode_length += 1;
        self.epsilon = self.config.epsilon_at(self.total_env_steps);

        let loss = self.train_step()?;

        let episode = if result.done {
            let stats = EpisodeStats {
                reward: self.episode_reward,
                length: self.episode_length,
            };
            self.episode_reward = 0.0;
            self.episode_length = 0;
            Some(stats)
        } else {
            self.observation = Some(result.observation);
            None
        };

        Ok(StepReport {
            env_steps: 1,
            episode,
            loss,
            epsilon: self.epsilon,
        })
    }

    fn total_steps(&self) -> u64 {
        self.total_env_steps
    }

    fn agent_steps(&self) -> u64 {
        self.steps
    }

    fn epsilon(&self) -> f64 {
        self.epsilon
    }

    fn model(&self) -> &UnrealModel {
        &self.online
    }

    fn save(&self, dir: &Path) -> Result<()> {
        self.online.save(dir.join("model.safetensors"))?;
        self.target.save(dir.join("target.safetensors"))?;
        save_optimizer(&self.optimizer, dir.join("optimizer.json"))?;
        self.replay.save(dir.join("replay.bin"))?;
        Ok(())
    }

    fn restore(&mut self, dir: &Path, meta: &TrainMeta) -> Result<()> {
        self.online.load(dir.join("model.safetensors"))?;
        self.target.load(dir.join("target.safetensors"))?;
        if let Err(err) = load_optimizer(&mut self.optimizer, dir.join("optimizer.json")) {
            tracing::warn!(%err, "optimizer state load failed, continuing with fresh optimizer");
        }
        self.replay = ReplayBuffer::load(dir.join("replay.bin"))?;
        self.total_env_steps = meta.total_steps;
        self.steps = meta.agent_steps;
        self.epsilon = meta.epsilon;
        self.observation = None;
        self.episode_reward = 0.0;
        self.episode_length = 0;
        Ok(())
    }
}
