use anyhow::{Result, ensure};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{BLACK, Environment, Observation, Rgb, StepResult, check_action, render_grid};
use crate::IMAGE_SIZE;

const WALL: Rgb = [0.5, 0.5, 0.5];
const AGENT: Rgb = [1.0, 0.0, 0.0];
const GOAL: Rgb = [0.0, 1.0, 0.0];

const NORTH: u8 = 1;
const SOUTH: u8 = 2;
const EAST: u8 = 4;
const WEST: u8 = 8;

/// Perfect maze carved by randomised depth-first search. The agent starts in
/// the top-left cell and must reach the bottom-right one.
pub struct MazeEnv {
    id: String,
    size: usize,
    /// Open-passage bitmask per cell.
    passages: Vec<u8>,
    agent: (usize, usize),
    done: bool,
    rng: SmallRng,
}

impl MazeEnv {
    pub const ACTION_COUNT: usize = 4;
    /// Largest maze whose `(2n+1)` render grid fits in one frame.
    pub const MAX_SIZE: usize = (IMAGE_SIZE - 1) / 2;

    pub fn new(size: usize, seed: u64) -> Result<Self> {
        ensure!(size >= 2, "maze must be at least 2x2, got {size}x{size}");
        ensure!(
            size <= Self::MAX_SIZE,
            "maze must be at most {0}x{0} to fit a {IMAGE_SIZE}px frame, got {size}x{size}",
            Self::MAX_SIZE
        );
        let mut env = Self {
            id: format!("Maze-{size}x{size}"),
            size,
            passages: vec![0; size * size],
            agent: (0, 0),
            done: true,
            rng: SmallRng::seed_from_u64(seed),
        };
        env.carve();
        Ok(env)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn agent(&self) -> (usize, usize) {
        self.agent
    }

    pub fn goal(&self) -> (usize, usize) {
        (self.size - 1, self.size - 1)
    }

    pub fn is_open(&self, (row, col): (usize, usize), direction: usize) -> bool {
        self.passages[row * self.size + col] & direction_bit(direction) != 0
    }

    fn step_penalty(&self) -> f32 {
        -0.1 / (self.size * self.size) as f32
    }

    fn carve(&mut self) {
        let n = self.size;
        let mut visited = vec![false; n * n];
        let mut stack = vec![(0usize, 0usize)];
        visited[0] = true;
        while let Some(&(row, col)) = stack.last() {
            let mut neighbours = Vec::with_capacity(4);
            if row > 0 && !visited[(row - 1) * n + col] {
                neighbours.push((row - 1, col, NORTH, SOUTH));
            }
            if row + 1 < n && !visited[(row + 1) * n + col] {
                neighbours.push((row + 1, col, SOUTH, NORTH));
            }
            if col + 1 < n && !visited[row * n + col + 1] {
                neighbours.push((row, col + 1, EAST, WEST));
            }
            if col > 0 && !visited[row * n + col - 1] {
                neighbours.push((row, col - 1, WEST, EAST));
            }
            neighbours.shuffle(&mut self.rng);
            match neighbours.first() {
                Some(&(nr, nc, out, back)) => {
                    self.passages[row * n + col] |= out;
                    self.passages[nr * n + nc] |= back;
                    visited[nr * n + nc] = true;
                    stack.push((nr, nc));
                }
                None => {
                    stack.pop();
                }
            }
        }
    }

    /// Cells render on a `(2n+1)` grid so walls get their own pixels.
    fn render(&self, agent: (usize, usize)) -> Vec<f32> {
        let n = self.size;
        let side = 2 * n + 1;
        let mut cells: Vec<Rgb> = vec![WALL; side * side];
        for row in 0..n {
            for col in 0..n {
                let (r, c) = (2 * row + 1, 2 * col + 1);
                cells[r * side + c] = BLACK;
                let open = self.passages[row * n + col];
                if open & SOUTH != 0 {
                    cells[(r + 1) * side + c] = BLACK;
                }
                if open & EAST != 0 {
                    cells[r * side + c + 1] = BLACK;
                }
            }
        }
        let (gr, gc) = self.goal();
        cells[(2 * gr + 1) * side + 2 * gc + 1] = GOAL;
        cells[(2 * agent.0 + 1) * side + 2 * agent.1 + 1] = AGENT;
        render_grid(&cells, side, side)
    }

    fn observe(&self) -> Observation {
        Observation::with_goal(self.render(self.agent), self.render(self.goal()))
    }
}

fn direction_bit(action: usize) -> u8 {
    match action {
        0 => NORTH,
        1 => SOUTH,
        2 => EAST,
        _ => WEST,
    }
}

impl Environment for MazeEnv {
    fn id(&self) -> &str {
        &self.id
    }

    fn action_count(&self) -> usize {
        Self::ACTION_COUNT
    }

    fn reset(&mut self) -> Result<Observation> {
        self.agent = (0, 0);
        self.done = false;
        Ok(self.observe())
    }

    fn step(&mut self, action: usize) -> Result<StepResult> {
        check_action(self, action)?;
        ensure!(!self.done, "step called on a finished episode; call reset");

        if self.is_open(self.agent, action) {
            let (row, col) = self.agent;
            self.agent = match action {
                0 => (row - 1, col),
                1 => (row + 1, col),
                2 => (row, col + 1),
                _ => (row, col - 1),
            };
        }

        let reward = if self.agent == self.goal() {
            self.done = true;
            1.0
        } else {
            self.step_penalty()
        };

        Ok(StepResult {
            observation: self.observe(),
            reward,
            done: self.done,
            truncated: false,
        })
    }
}
