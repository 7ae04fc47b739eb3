use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};
use rand::Rng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;

use crate::env::Observation;
use crate::model::stack_observations;

// =============================================================================
// Experience Replay Buffer
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct Transition {
    pub observation: Observation,
    pub action: usize,
    pub reward: f32,
    pub next_observation: Observation,
    pub done: bool,
}

#[derive(Serialize, Deserialize)]
pub struct ReplayBuffer {
    buffer: VecDeque<Transition>,
    capacity: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(1 << 16)),
            capacity,
        }
    }

    pub fn push(&mut self, t: Transition) {
        if self.capacity == 0 {
            return;
        }
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(t);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.buffer.iter()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let writer = std::io::BufWriter::new(file);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = std::io::BufReader::new(file);
        let replay = bincode::deserialize_from(reader)?;
        Ok(replay)
    }

    /// Uniform sample with replacement, stacked into tensors. Goal frames are
    /// stacked when `with_goals` is set.
    pub fn sample(
        &self,
        batch_size: usize,
        with_goals: bool,
        dev: &Device,
        rng: &mut SmallRng,
    ) -> Result<BatchTensors> {
        let len = self.buffer.len();
        ensure!(batch_size > 0, "batch size must be positive");
        ensure!(
            len >= batch_size,
            "cannot sample {batch_size} transitions from a buffer of {len}"
        );

        let mut picked = Vec::with_capacity(batch_size);
        let mut actions = Vec::with_capacity(batch_size);
        let mut rewards = Vec::with_capacity(batch_size);
        let mut dones = Vec::with_capacity(batch_size);

        for _ in 0..batch_size {
            let idx = rng.random_range(0..len);
            let t = &self.buffer[idx];
            picked.push(t);
            actions.push(t.action as i64);
            rewards.push(t.reward);
            dones.push(if t.done { 0.0f32 } else { 1.0f32 });
        }

        let current: Vec<&Observation> = picked.iter().map(|t| &t.observation).collect();
        let next: Vec<&Observation> = picked.iter().map(|t| &t.next_observation).collect();
        let (states, goals) = stack_observations(&current, with_goals, dev)?;
        let (next_states, next_goals) = stack_observations(&next, with_goals, dev)?;

        Ok(BatchTensors {
            states,
            goals,
            actions: Tensor::from_vec(actions, batch_size, dev)?,
            rewards: Tensor::from_vec(rewards, batch_size, dev)?,
            next_states,
            next_goals,
            not_dones: Tensor::from_vec(dones, batch_size, dev)?,
        })
    }
}

pub struct BatchTensors {
    /// `[B, 3, 84, 84]`
    pub states: Tensor,
    pub goals: Option<Tensor>,
    /// `i64` action indices `[B]`
    pub actions: Tensor,
    pub rewards: Tensor,
    pub next_states: Tensor,
    pub next_goals: Option<Tensor>,
    /// 0 for terminal transitions, 1 otherwise.
    pub not_dones: Tensor,
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use rand::SeedableRng;

    use super::*;
    use crate::IMAGE_LEN;

    fn transition(tag: f32, done: bool) -> Transition {
        Transition {
            observation: Observation::new(vec![tag; IMAGE_LEN]),
            action: tag as usize % 3,
            reward: tag,
            next_observation: Observation::new(vec![tag + 0.5; IMAGE_LEN]),
            done,
        }
    }

    #[test]
    fn oldest_entry_is_evicted_when_full() {
        let mut replay = ReplayBuffer::new(3);
        for i in 0..5 {
            replay.push(transition(i as f32, false));
        }
        assert_eq!(replay.len(), 3);
        assert_eq!(replay.capacity(), 3);
        let rewards: Vec<f32> = replay.iter().map(|t| t.reward).collect();
        assert_eq!(rewards, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn sample_stacks_batch_tensors() -> Result<()> {
        let mut replay = ReplayBuffer::new(10);
        replay.push(transition(1.0, true));
        replay.push(transition(2.0, false));
        let mut rng = SmallRng::seed_from_u64(7);
        let batch = replay.sample(4, false, &Device::Cpu, &mut rng)?;
        assert_eq!(batch.states.dims(), &[4, 3, 84, 84]);
        assert_eq!(batch.next_states.dims(), &[4, 3, 84, 84]);
        assert!(batch.goals.is_none());

        let rewards = batch.rewards.to_vec1::<f32>()?;
        let not_dones = batch.not_dones.to_vec1::<f32>()?;
        let actions = batch.actions.to_vec1::<i64>()?;
        for ((r, nd), a) in rewards.iter().zip(&not_dones).zip(&actions) {
            if *r == 1.0 {
                assert_eq!((*nd, *a), (0.0, 1));
            } else {
                assert_eq!((*nd, *a), (1.0, 2));
            }
        }
        Ok(())
    }

    #[test]
    fn oversampling_is_an_error() {
        let mut replay = ReplayBuffer::new(10);
        replay.push(transition(0.0, false));
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(replay.sample(2, false, &Device::Cpu, &mut rng).is_err());
    }

    #[test]
    fn goals_are_required_when_requested() -> Result<()> {
        let mut replay = ReplayBuffer::new(4);
        replay.push(transition(0.0, false));
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(replay.sample(1, true, &Device::Cpu, &mut rng).is_err());

        let goal = vec![0.25; IMAGE_LEN];
        replay.push(Transition {
            observation: Observation::with_goal(vec![0.0; IMAGE_LEN], goal.clone()),
            action: 0,
            reward: 0.0,
            next_observation: Observation::with_goal(vec![0.1; IMAGE_LEN], goal),
            done: false,
        });
        let mut only_goal = ReplayBuffer::new(1);
        only_goal.push(replay.iter().last().cloned().context("pushed")?);
        let batch = only_goal.sample(1, true, &Device::Cpu, &mut rng)?;
        assert_eq!(batch.goals.map(|g| g.dims().to_vec()), Some(vec![1, 3, 84, 84]));
        Ok(())
    }

    #[test]
    fn buffer_round_trips_through_bincode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("replay.bin");
        let mut replay = ReplayBuffer::new(8);
        replay.push(transition(3.0, true));
        replay.save(&path)?;

        let loaded = ReplayBuffer::load(&path)?;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.capacity(), 8);
        let t = loaded.iter().next().context("one transition")?;
        assert_eq!(t.observation, replay.iter().next().context("one")?.observation);
        assert!(t.done);
        Ok(())
    }
}
