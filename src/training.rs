//! Experiment runner: drives a [`Trainer`] for a fixed number of environment
//! steps, logs episode statistics and writes checkpoints.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::checkpoint::{
    TrainMeta, load_meta, load_recent_rewards, save_checkpoint, save_recent_rewards,
};
use crate::model::UnrealModel;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeStats {
    pub reward: f64,
    pub length: u64,
}

/// Outcome of one [`Trainer::step`].
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    /// Environment steps consumed by this call.
    pub env_steps: u64,
    pub episode: Option<EpisodeStats>,
    pub loss: Option<f32>,
    pub epsilon: f64,
}

pub trait Trainer {
    fn step(&mut self) -> Result<StepReport>;

    /// Environment steps taken so far, including any restored from a checkpoint.
    fn total_steps(&self) -> u64;

    /// Gradient updates applied so far.
    fn agent_steps(&self) -> u64;

    fn epsilon(&self) -> f64;

    fn model(&self) -> &UnrealModel;

    /// Write weights, optimizer state and any trainer-owned buffers into `dir`.
    fn save(&self, dir: &Path) -> Result<()>;

    /// Restore the state written by [`Trainer::save`] plus the counters in
    /// `meta`.
    fn restore(&mut self, dir: &Path, meta: &TrainMeta) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub max_time_steps: u64,
    pub episode_log_interval: u64,
    pub checkpoint_dir: PathBuf,
    /// Steps between periodic snapshots; 0 disables them.
    pub save_interval: u64,
    pub reward_window: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_time_steps: 1_000_000,
            episode_log_interval: 10,
            checkpoint_dir: PathBuf::from("checkpoints"),
            save_interval: 50_000,
            reward_window: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub episodes: u64,
    pub total_steps: u64,
    pub best_reward: Option<f64>,
    pub mean_recent_reward: f64,
}

pub struct TrainingRunner<T: Trainer> {
    trainer: T,
    config: RunConfig,
    best_reward: Option<f64>,
    episode: u64,
    recent_rewards: VecDeque<f64>,
    loss_sum: f64,
    loss_count: u64,
}

impl<T: Trainer> TrainingRunner<T> {
    pub fn new(trainer: T, config: RunConfig) -> Self {
        let window = config.reward_window.max(1);
        Self {
            trainer,
            config,
            best_reward: None,
            episode: 0,
            recent_rewards: VecDeque::with_capacity(window),
            loss_sum: 0.0,
            loss_count: 0,
        }
    }

    /// Continue from a checkpoint directory written by a previous run.
    pub fn resume<P: AsRef<Path>>(&mut self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let meta = load_meta(dir)?;
        self.trainer.restore(dir, &meta)?;
        self.best_reward = meta.best_reward;
        self.episode = meta.episode;
        self.recent_rewards = load_recent_rewards(dir)?;
        while self.recent_rewards.len() > self.config.reward_window.max(1) {
            self.recent_rewards.pop_front();
        }
        tracing::info!(
            dir = %dir.display(),
            steps = meta.total_steps,
            episode = meta.episode,
            epsilon = meta.epsilon,
            "resumed"
        );
        Ok(())
    }

    pub fn trainer(&self) -> &T {
        &self.trainer
    }

    pub fn into_trainer(self) -> T {
        self.trainer
    }

    pub fn best_reward(&self) -> Option<f64> {
        self.best_reward
    }

    pub fn episode(&self) -> u64 {
        self.episode
    }

    fn meta(&self) -> TrainMeta {
        TrainMeta {
            best_reward: self.best_reward,
            episode: self.episode,
            total_steps: self.trainer.total_steps(),
            epsilon: self.trainer.epsilon(),
            agent_steps: self.trainer.agent_steps(),
        }
    }

    fn mean_recent_reward(&self) -> f64 {
        if self.recent_rewards.is_empty() {
            return 0.0;
        }
        self.recent_rewards.iter().sum::<f64>() / self.recent_rewards.len() as f64
    }

    fn checkpoint(&self, snapshot: Option<&str>) -> Result<()> {
        let dir = &self.config.checkpoint_dir;
        save_checkpoint(&self.trainer, &self.meta(), dir)?;
        save_recent_rewards(&self.recent_rewards, dir)?;
        if let Some(name) = snapshot {
            self.trainer.model().save(dir.join(name))?;
        }
        Ok(())
    }

    fn record_episode(
        &mut self,
        stats: EpisodeStats,
        epsilon: f64,
        started: Instant,
        start_steps: u64,
    ) -> Result<()> {
        self.episode += 1;
        self.recent_rewards.push_back(stats.reward);
        while self.recent_rewards.len() > self.config.reward_window.max(1) {
            self.recent_rewards.pop_front();
        }

        if self.best_reward.is_none_or(|best| stats.reward > best) {
            self.best_reward = Some(stats.reward);
            self.checkpoint(Some("best.safetensors"))?;
        }

        let interval = self.config.episode_log_interval;
        if interval > 0 && self.episode % interval == 0 {
            let total_steps = self.trainer.total_steps();
            let elapsed = started.elapsed().as_secs_f64().max(1e-9);
            let fps = (total_steps - start_steps) as f64 / elapsed;
            let avg_loss = if self.loss_count > 0 {
                self.loss_sum / self.loss_count as f64
            } else {
                0.0
            };
            tracing::info!(
                "Ep {:>5} | Steps {:>8} | R {:>8.2} | Avg{} {:>7.2} | Len {:>5} | ε {:.4} | Loss {:.5} | FPS {:.0}",
                self.episode,
                total_steps,
                stats.reward,
                self.config.reward_window,
                self.mean_recent_reward(),
                stats.length,
                epsilon,
                avg_loss,
                fps,
            );
            self.loss_sum = 0.0;
            self.loss_count = 0;
        }
        Ok(())
    }

    /// Train until `max_time_steps`, then write the final checkpoint.
    pub fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let start_steps = self.trainer.total_steps();
        let save_interval = self.config.save_interval;
        let mut next_save = if save_interval > 0 {
            (start_steps / save_interval + 1) * save_interval
        } else {
            u64::MAX
        };

        while self.trainer.total_steps() < self.config.max_time_steps {
            let report = self.trainer.step()?;
            if let Some(loss) = report.loss {
                self.loss_sum += loss as f64;
                self.loss_count += 1;
            }
            if let Some(stats) = report.episode {
                self.record_episode(stats, report.epsilon, started, start_steps)?;
            }

            let total_steps = self.trainer.total_steps();
            if total_steps >= next_save {
                self.checkpoint(Some(&format!("step_{total_steps}.safetensors")))?;
                while next_save <= total_steps {
                    next_save += save_interval;
                }
            }
        }

        self.checkpoint(Some("final.safetensors"))?;
        let summary = RunSummary {
            episodes: self.episode,
            total_steps: self.trainer.total_steps(),
            best_reward: self.best_reward,
            mean_recent_reward: self.mean_recent_reward(),
        };
        tracing::info!(
            steps = summary.total_steps,
            episodes = summary.episodes,
            best = summary.best_reward,
            seconds = started.elapsed().as_secs_f64(),
            "training complete"
        );
        Ok(summary)
    }
}
