use anyhow::{Result, ensure};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{BLACK, Environment, Observation, Rgb, StepResult, WHITE, check_action, render_grid};
use crate::IMAGE_SIZE;

const PADDLE_WIDTH: usize = 3;

/// Falling-ball catch game. Left / stay / right moves a 3-cell paddle along the
/// bottom row; the episode ends when the ball lands.
pub struct CatchEnv {
    grid_size: usize,
    ball_row: usize,
    ball_col: usize,
    /// Column of the paddle's centre cell.
    paddle_col: usize,
    done: bool,
    rng: SmallRng,
}

impl CatchEnv {
    pub const ACTION_COUNT: usize = 3;

    pub fn new(grid_size: usize, seed: u64) -> Result<Self> {
        ensure!(
            grid_size >= PADDLE_WIDTH + 2,
            "catch grid must be at least {} cells wide, got {grid_size}",
            PADDLE_WIDTH + 2
        );
        ensure!(
            grid_size <= IMAGE_SIZE,
            "catch grid must be at most {IMAGE_SIZE} cells wide, got {grid_size}"
        );
        Ok(Self {
            grid_size,
            ball_row: 0,
            ball_col: 0,
            paddle_col: grid_size / 2,
            done: true,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn ball(&self) -> (usize, usize) {
        (self.ball_row, self.ball_col)
    }

    pub fn paddle_col(&self) -> usize {
        self.paddle_col
    }

    fn caught(&self) -> bool {
        self.ball_col.abs_diff(self.paddle_col) <= PADDLE_WIDTH / 2
    }

    fn observe(&self) -> Observation {
        let n = self.grid_size;
        let mut cells: Vec<Rgb> = vec![BLACK; n * n];
        cells[self.ball_row * n + self.ball_col] = WHITE;
        let half = PADDLE_WIDTH / 2;
        for col in self.paddle_col - half..=self.paddle_col + half {
            cells[(n - 1) * n + col] = WHITE;
        }
        Observation::new(render_grid(&cells, n, n))
    }
}

impl Environment for CatchEnv {
    fn id(&self) -> &str {
        "Catch-v0"
    }

    fn action_count(&self) -> usize {
        Self::ACTION_COUNT
    }

    fn reset(&mut self) -> Result<Observation> {
        self.ball_row = 0;
        self.ball_col = self.rng.random_range(0..self.grid_size);
        self.paddle_col = self
            .rng
            .random_range(PADDLE_WIDTH / 2..self.grid_size - PADDLE_WIDTH / 2);
        self.done = false;
        Ok(self.observe())
    }

    fn step(&mut self, action: usize) -> Result<StepResult> {
        check_action(self, action)?;
        ensure!(!self.done, "step called on a finished episode; call reset");

        let half = PADDLE_WIDTH / 2;
        self.paddle_col = match action {
            0 => self.paddle_col.saturating_sub(1).max(half),
            2 => (self.paddle_col + 1).min(self.grid_size - 1 - half),
            _ => self.paddle_col,
        };
        self.ball_row += 1;

        let mut reward = 0.0;
        if self.ball_row == self.grid_size - 1 {
            self.done = true;
            reward = if self.caught() { 1.0 } else { -1.0 };
        }

        Ok(StepResult {
            observation: self.observe(),
            reward,
            done: self.done,
            truncated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episode_lasts_grid_height_and_pays_once() -> Result<()> {
        let mut env = CatchEnv::new(10, 3)?;
        env.reset()?;
        let mut steps = 0;
        let mut total = 0.0;
        loop {
            let result = env.step(1)?;
            steps += 1;
            total += result.reward;
            if result.done {
                break;
            }
            assert_eq!(result.reward, 0.0);
        }
        assert_eq!(steps, 9);
        assert!(total == 1.0 || total == -1.0);
        Ok(())
    }

    #[test]
    fn tracking_the_ball_always_catches() -> Result<()> {
        let mut env = CatchEnv::new(10, 11)?;
        for _ in 0..20 {
            env.reset()?;
            loop {
                let (_, ball) = env.ball();
                let action = match ball.cmp(&env.paddle_col()) {
                    std::cmp::Ordering::Less => 0,
                    std::cmp::Ordering::Equal => 1,
                    std::cmp::Ordering::Greater => 2,
                };
                let result = env.step(action)?;
                if result.done {
                    assert_eq!(result.reward, 1.0);
                    break;
                }
            }
        }
        Ok(())
    }

    #[test]
    fn paddle_stays_on_the_board() -> Result<()> {
        let mut env = CatchEnv::new(6, 0)?;
        env.reset()?;
        for _ in 0..4 {
            env.step(0)?;
        }
        assert_eq!(env.paddle_col(), 1);
        Ok(())
    }

    #[test]
    fn invalid_action_and_finished_episode_error() -> Result<()> {
        let mut env = CatchEnv::new(10, 0)?;
        env.reset()?;
        assert!(env.step(3).is_err());
        while !env.step(1)?.done {}
        assert!(env.step(1).is_err());
        Ok(())
    }

    #[test]
    fn widest_grid_still_shows_the_ball() -> Result<()> {
        assert!(CatchEnv::new(IMAGE_SIZE + 1, 0).is_err());
        let mut env = CatchEnv::new(IMAGE_SIZE, 2)?;
        for _ in 0..10 {
            let obs = env.reset()?;
            let (row, col) = env.ball();
            assert_eq!(obs.image[row * IMAGE_SIZE + col], 1.0);
        }
        Ok(())
    }

    #[test]
    fn frame_contains_ball_and_paddle() -> Result<()> {
        let mut env = CatchEnv::new(10, 5)?;
        let obs = env.reset()?;
        let lit = obs.image.iter().filter(|&&v| v > 0.0).count();
        // 4 white cells (ball + 3 paddle) across 3 channels, each ~8x8 pixels.
        assert!(lit > 3 * 4 * 49);
        assert!(obs.goal.is_none());
        Ok(())
    }
}
