use anyhow::{Result, bail, ensure};
use rand::Rng;
use rand::rngs::SmallRng;
use std::collections::VecDeque;

use crate::env::Observation;
use crate::model::{RP_FRAMES, concat_action_and_reward};

/// One environment transition as seen by the auxiliary tasks: `action` was
/// taken in `observation` and produced `reward`.
#[derive(Debug, Clone)]
pub struct ExperienceFrame {
    pub observation: Observation,
    pub action: usize,
    pub reward: f32,
    pub terminal: bool,
    /// 20x20 row-major intensity change caused by `action`.
    pub pixel_change: Vec<f32>,
    /// Action and reward that led into `observation`.
    pub last_action: Option<usize>,
    pub last_reward: f32,
}

impl ExperienceFrame {
    /// Network input for this frame: previous action one-hot plus the clipped
    /// previous reward.
    pub fn last_action_reward(&self, action_size: usize) -> Vec<f32> {
        concat_action_and_reward(self.last_action, action_size, self.last_reward.clamp(-1.0, 1.0))
    }
}

/// Fixed-size history of frames for value replay, pixel control and reward
/// prediction.
///
/// Frames carry absolute indices (`top_frame_index` is the index of the
/// oldest stored frame). Frames with at least three predecessors are indexed
/// by whether their reward is zero, so reward prediction can draw rewarding
/// and non-rewarding sequences equally often.
pub struct ExperienceBuffer {
    history_size: usize,
    frames: VecDeque<ExperienceFrame>,
    zero_reward_indices: VecDeque<u64>,
    non_zero_reward_indices: VecDeque<u64>,
    top_frame_index: u64,
}

impl ExperienceBuffer {
    pub fn new(history_size: usize) -> Self {
        Self {
            history_size,
            frames: VecDeque::with_capacity(history_size),
            zero_reward_indices: VecDeque::new(),
            non_zero_reward_indices: VecDeque::new(),
            top_frame_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.history_size
    }

    pub fn zero_reward_count(&self) -> usize {
        self.zero_reward_indices.len()
    }

    pub fn non_zero_reward_count(&self) -> usize {
        self.non_zero_reward_indices.len()
    }

    /// Append a frame, evicting the oldest when full. A terminal frame
    /// directly after another terminal frame is dropped.
    pub fn add_frame(&mut self, frame: ExperienceFrame) {
        if frame.terminal && self.frames.back().is_some_and(|last| last.terminal) {
            tracing::warn!("consecutive terminal frames, dropping the second");
            return;
        }

        let frame_index = self.top_frame_index + self.frames.len() as u64;
        let was_full = self.is_full();
        let zero_reward = frame.reward == 0.0;
        self.frames.push_back(frame);

        if frame_index >= RP_FRAMES as u64 {
            if zero_reward {
                self.zero_reward_indices.push_back(frame_index);
            } else {
                self.non_zero_reward_indices.push_back(frame_index);
            }
        }

        if was_full {
            self.frames.pop_front();
            self.top_frame_index += 1;
            let cut_frame_index = self.top_frame_index + RP_FRAMES as u64;
            for indices in [&mut self.zero_reward_indices, &mut self.non_zero_reward_indices] {
                while indices.front().is_some_and(|&i| i < cut_frame_index) {
                    indices.pop_front();
                }
            }
        }
    }

    /// Up to `sequence_size` consecutive frames in time order. The sequence
    /// never starts on a terminal frame and ends early at the first terminal
    /// frame it meets.
    pub fn sample_sequence(
        &self,
        sequence_size: usize,
        rng: &mut SmallRng,
    ) -> Result<Vec<&ExperienceFrame>> {
        ensure!(sequence_size > 0, "sequence size must be positive");
        ensure!(
            self.frames.len() > sequence_size,
            "need more than {sequence_size} frames to sample a sequence, have {}",
            self.frames.len()
        );
        let mut start = rng.random_range(0..self.frames.len() - sequence_size);
        if self.frames[start].terminal {
            start += 1;
        }

        let mut sampled = Vec::with_capacity(sequence_size);
        for frame in self.frames.range(start..start + sequence_size) {
            sampled.push(frame);
            if frame.terminal {
                break;
            }
        }
        Ok(sampled)
    }

    /// Four consecutive frames; the reward of the fourth is the prediction
    /// target for the first three. Zero and non-zero targets are drawn with
    /// equal probability when both exist.
    pub fn sample_rp_sequence(&self, rng: &mut SmallRng) -> Result<Vec<&ExperienceFrame>> {
        let from_zero = match (
            self.zero_reward_indices.is_empty(),
            self.non_zero_reward_indices.is_empty(),
        ) {
            (true, true) => bail!("no frames available for reward prediction"),
            (true, false) => false,
            (false, true) => true,
            (false, false) => rng.random_bool(0.5),
        };
        let indices = if from_zero {
            &self.zero_reward_indices
        } else {
            &self.non_zero_reward_indices
        };
        let end_frame_index = indices[rng.random_range(0..indices.len())];
        let start = (end_frame_index - RP_FRAMES as u64 - self.top_frame_index) as usize;
        Ok(self.frames.range(start..=start + RP_FRAMES).collect())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn frame(tag: usize, reward: f32, terminal: bool) -> ExperienceFrame {
        ExperienceFrame {
            observation: Observation::new(vec![tag as f32]),
            action: tag,
            reward,
            terminal,
            pixel_change: Vec::new(),
            last_action: None,
            last_reward: 0.0,
        }
    }

    fn tag(frame: &ExperienceFrame) -> usize {
        frame.action
    }

    #[test]
    fn eviction_keeps_reward_indices_in_range() {
        let mut buffer = ExperienceBuffer::new(6);
        for i in 0..10 {
            let reward = if i % 3 == 0 { 1.0 } else { 0.0 };
            buffer.add_frame(frame(i, reward, false));
        }
        assert!(buffer.is_full());
        assert_eq!(buffer.len(), 6);
        // Stored frames are 4..=9; labels need three stored predecessors, so 7..=9.
        assert_eq!(buffer.non_zero_reward_count(), 1);
        assert_eq!(buffer.zero_reward_count(), 2);
    }

    #[test]
    fn consecutive_terminals_are_dropped() {
        let mut buffer = ExperienceBuffer::new(4);
        buffer.add_frame(frame(0, 1.0, true));
        buffer.add_frame(frame(1, 1.0, true));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn sequences_stop_at_terminal_frames() -> Result<()> {
        let mut buffer = ExperienceBuffer::new(12);
        for i in 0..12 {
            buffer.add_frame(frame(i, 0.0, i == 5));
        }
        let mut rng = SmallRng::seed_from_u64(5);
        for _ in 0..50 {
            let seq = buffer.sample_sequence(4, &mut rng)?;
            assert!(!seq.is_empty());
            assert!(tag(seq[0]) != 5 || seq.len() == 1);
            for pair in seq.windows(2) {
                assert_eq!(tag(pair[1]), tag(pair[0]) + 1);
                assert!(!pair[0].terminal);
            }
        }
        assert!(buffer.sample_sequence(12, &mut rng).is_err());
        Ok(())
    }

    #[test]
    fn rp_sequence_is_labelled_by_its_last_frame() -> Result<()> {
        let mut buffer = ExperienceBuffer::new(20);
        for i in 0..20 {
            let reward = if i == 9 { -1.0 } else { 0.0 };
            buffer.add_frame(frame(i, reward, false));
        }
        let mut rng = SmallRng::seed_from_u64(1);
        let mut saw_reward = 0;
        for _ in 0..200 {
            let seq = buffer.sample_rp_sequence(&mut rng)?;
            assert_eq!(seq.len(), 4);
            assert!(tag(seq[0]) + 3 == tag(seq[3]));
            if seq[3].reward != 0.0 {
                assert_eq!(tag(seq[3]), 9);
                saw_reward += 1;
            }
        }
        // One rewarding frame among 17 candidates, drawn about half the time.
        assert!(saw_reward > 60, "saw {saw_reward}");
        Ok(())
    }

    #[test]
    fn rp_needs_labelled_frames() {
        let mut buffer = ExperienceBuffer::new(8);
        for i in 0..3 {
            buffer.add_frame(frame(i, 1.0, false));
        }
        let mut rng = SmallRng::seed_from_u64(0);
        assert!(buffer.sample_rp_sequence(&mut rng).is_err());
    }

    #[test]
    fn last_action_reward_is_clipped() {
        let mut f = frame(2, 5.0, false);
        f.last_action = Some(1);
        f.last_reward = -3.0;
        assert_eq!(f.last_action_reward(3), vec![0.0, 1.0, 0.0, -1.0]);
    }
}
