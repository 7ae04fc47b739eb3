use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::{IMAGE_CHANNELS, IMAGE_LEN, IMAGE_SIZE};

pub mod catch;
pub mod maze;

pub use catch::CatchEnv;
pub use maze::MazeEnv;

// =============================================================================
// Environment Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// `Catch-v0`, `Maze-v0` or `Maze-<n>x<n>`
    pub id: String,
    pub catch_grid_size: usize,
    pub maze_size: usize,
    pub max_episode_steps: Option<u64>,
    pub seed: Option<u64>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            id: "Catch-v0".to_string(),
            catch_grid_size: 10,
            maze_size: 5,
            max_episode_steps: None,
            seed: None,
        }
    }
}

// =============================================================================
// Environment Interface
// =============================================================================

/// Channel-major RGB frame (3 x 84 x 84) in [0, 1], plus the goal frame for
/// goal-conditioned environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub image: Vec<f32>,
    pub goal: Option<Vec<f32>>,
}

impl Observation {
    pub fn new(image: Vec<f32>) -> Self {
        Self { image, goal: None }
    }

    pub fn with_goal(image: Vec<f32>, goal: Vec<f32>) -> Self {
        Self {
            image,
            goal: Some(goal),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub observation: Observation,
    pub reward: f32,
    pub done: bool,
    /// Episode was cut by a step limit rather than reaching a terminal state.
    pub truncated: bool,
}

pub trait Environment {
    fn id(&self) -> &str;
    fn action_count(&self) -> usize;
    fn reset(&mut self) -> Result<Observation>;
    fn step(&mut self, action: usize) -> Result<StepResult>;
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn action_count(&self) -> usize {
        (**self).action_count()
    }

    fn reset(&mut self) -> Result<Observation> {
        (**self).reset()
    }

    fn step(&mut self, action: usize) -> Result<StepResult> {
        (**self).step(action)
    }
}

pub(crate) fn check_action(env: &dyn Environment, action: usize) -> Result<()> {
    ensure!(
        action < env.action_count(),
        "action {action} out of range for {} ({} actions)",
        env.id(),
        env.action_count()
    );
    Ok(())
}

// =============================================================================
// Step Limit Wrapper
// =============================================================================

pub struct TimeLimit<E> {
    inner: E,
    max_episode_steps: Option<u64>,
    elapsed: u64,
}

impl<E: Environment> TimeLimit<E> {
    pub fn new(inner: E, max_episode_steps: Option<u64>) -> Self {
        Self {
            inner,
            max_episode_steps,
            elapsed: 0,
        }
    }
}

impl<E: Environment> Environment for TimeLimit<E> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn action_count(&self) -> usize {
        self.inner.action_count()
    }

    fn reset(&mut self) -> Result<Observation> {
        self.elapsed = 0;
        self.inner.reset()
    }

    fn step(&mut self, action: usize) -> Result<StepResult> {
        let mut result = self.inner.step(action)?;
        self.elapsed += 1;
        if let Some(limit) = self.max_episode_steps {
            if self.elapsed >= limit && !result.done {
                result.done = true;
                result.truncated = true;
            }
        }
        Ok(result)
    }
}

/// Resolve an environment id into a boxed environment, wrapped in a
/// [`TimeLimit`] when `max_episode_steps` is set.
pub fn make_env(config: &EnvConfig) -> Result<Box<dyn Environment>> {
    let seed = config.seed.unwrap_or_else(rand::random);
    let env: Box<dyn Environment> = match config.id.as_str() {
        "Catch-v0" => Box::new(CatchEnv::new(config.catch_grid_size, seed)?),
        "Maze-v0" => Box::new(MazeEnv::new(config.maze_size, seed)?),
        id => match parse_maze_id(id) {
            Some(size) => Box::new(MazeEnv::new(size, seed)?),
            None => bail!("unknown environment id: {id}"),
        },
    };
    Ok(match config.max_episode_steps {
        Some(limit) => Box::new(TimeLimit::new(env, Some(limit))),
        None => env,
    })
}

fn parse_maze_id(id: &str) -> Option<usize> {
    let dims = id.strip_prefix("Maze-")?;
    let (w, h) = dims.split_once('x')?;
    let w: usize = w.parse().ok()?;
    let h: usize = h.parse().ok()?;
    (w == h && w > 1).then_some(w)
}

// =============================================================================
// Rendering
// =============================================================================

pub type Rgb = [f32; 3];

pub const BLACK: Rgb = [0.0, 0.0, 0.0];
pub const WHITE: Rgb = [1.0, 1.0, 1.0];

/// Nearest-neighbour upscale of a `rows x cols` colour grid to a 3x84x84 frame.
/// Every cell gets at least one pixel as long as neither side exceeds 84.
pub fn render_grid(cells: &[Rgb], rows: usize, cols: usize) -> Vec<f32> {
    debug_assert_eq!(cells.len(), rows * cols);
    debug_assert!(rows <= IMAGE_SIZE && cols <= IMAGE_SIZE);
    let plane = IMAGE_SIZE * IMAGE_SIZE;
    let mut image = vec![0f32; IMAGE_LEN];
    for y in 0..IMAGE_SIZE {
        let row = y * rows / IMAGE_SIZE;
        for x in 0..IMAGE_SIZE {
            let col = x * cols / IMAGE_SIZE;
            let color = cells[row * cols + col];
            for (c, value) in color.iter().enumerate().take(IMAGE_CHANNELS) {
                image[c * plane + y * IMAGE_SIZE + x] = *value;
            }
        }
    }
    image
}
