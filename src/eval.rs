use anyhow::Result;
use rand::Rng;
use rand::rngs::SmallRng;

use crate::env::{Environment, Observation};
use crate::model::{UnrealModel, concat_action_and_reward};

#[derive(Debug, Clone, PartialEq)]
pub struct EvalStats {
    pub avg_reward: f64,
    pub avg_length: f64,
    pub max_reward: f64,
    pub episodes: usize,
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn run_episodes(
    env: &mut dyn Environment,
    episodes: usize,
    max_steps: u64,
    mut policy: impl FnMut(&Observation, Option<usize>, f32) -> Result<usize>,
) -> Result<EvalStats> {
    let eval_episodes = episodes.max(1);
    let mut total_reward = 0.0f64;
    let mut total_steps = 0u64;
    let mut max_reward = f64::NEG_INFINITY;

    for _ in 0..eval_episodes {
        let mut obs = env.reset()?;
        let mut ep_reward = 0.0f64;
        let mut ep_steps = 0u64;
        let mut last_action = None;
        let mut last_reward = 0.0f32;

        loop {
            let action = policy(&obs, last_action, last_reward)?;
            let result = env.step(action)?;
            ep_reward += result.reward as f64;
            ep_steps += 1;
            last_action = Some(action);
            last_reward = result.reward;
            obs = result.observation;

            if result.done || (max_steps > 0 && ep_steps >= max_steps) {
                break;
            }
        }

        total_reward += ep_reward;
        total_steps += ep_steps;
        max_reward = max_reward.max(ep_reward);
    }

    let denom = eval_episodes as f64;
    Ok(EvalStats {
        avg_reward: total_reward / denom,
        avg_length: total_steps as f64 / denom,
        max_reward,
        episodes: eval_episodes,
    })
}

/// Greedy evaluation: argmax Q with the dueling head, otherwise the most
/// probable policy action. `max_steps` of 0 runs each episode to completion.
pub fn run_eval(
    model: &mut UnrealModel,
    env: &mut dyn Environment,
    episodes: usize,
    max_steps: u64,
) -> Result<EvalStats> {
    let action_size = model.action_size();
    let deepq = model.config().use_deepq_network;
    run_episodes(env, episodes, max_steps, |obs, last_action, last_reward| {
        if deepq {
            return model.predict(obs);
        }
        // No previous action means a fresh episode.
        if last_action.is_none() {
            model.reset_state();
        }
        let last_reward = last_reward.clamp(-1.0, 1.0);
        let lar = concat_action_and_reward(last_action, action_size, last_reward);
        let (pi, _) = model.run_base_policy_and_value(obs, &lar)?;
        Ok(argmax(&pi))
    })
}

/// Uniform random policy, for comparison against trained agents.
pub fn run_baseline(
    env: &mut dyn Environment,
    episodes: usize,
    max_steps: u64,
    rng: &mut SmallRng,
) -> Result<EvalStats> {
    let actions = env.action_count();
    run_episodes(env, episodes, max_steps, |_, _, _| Ok(rng.random_range(0..actions)))
}

#[cfg(test)]
mod tests {
    use candle_core::Device;
    use rand::SeedableRng;

    use super::*;
    use crate::env::{CatchEnv, MazeEnv};
    use crate::model::ModelConfig;

    #[test]
    fn zero_episodes_still_runs_one() -> Result<()> {
        let mut env = CatchEnv::new(5, 1)?;
        let mut rng = SmallRng::seed_from_u64(0);
        let stats = run_baseline(&mut env, 0, 0, &mut rng)?;
        assert_eq!(stats.episodes, 1);
        assert_eq!(stats.avg_length, 4.0);
        Ok(())
    }

    #[test]
    fn max_steps_cuts_long_episodes() -> Result<()> {
        let mut env = MazeEnv::new(6, 3)?;
        let mut rng = SmallRng::seed_from_u64(0);
        let stats = run_baseline(&mut env, 3, 7, &mut rng)?;
        assert!(stats.avg_length <= 7.0);
        Ok(())
    }

    #[test]
    fn greedy_eval_with_either_head() -> Result<()> {
        let mut env = CatchEnv::new(5, 4)?;
        let mut dueling = UnrealModel::new(
            ModelConfig {
                use_deepq_network: true,
                ..Default::default()
            },
            &Device::Cpu,
        )?;
        let stats = run_eval(&mut dueling, &mut env, 2, 0)?;
        assert_eq!(stats.episodes, 2);
        assert!(stats.avg_reward.abs() <= 1.0);

        let mut recurrent = UnrealModel::new(
            ModelConfig {
                use_lstm: true,
                ..Default::default()
            },
            &Device::Cpu,
        )?;
        let stats = run_eval(&mut recurrent, &mut env, 2, 0)?;
        assert_eq!(stats.avg_length, 4.0);
        assert!(recurrent.lstm_state().is_some());
        Ok(())
    }
}
