#[cfg(feature = "accelerate")]
extern crate accelerate_src;

pub const IMAGE_SIZE: usize = 84;
pub const IMAGE_CHANNELS: usize = 3;
pub const IMAGE_LEN: usize = IMAGE_CHANNELS * IMAGE_SIZE * IMAGE_SIZE;

pub mod checkpoint;
pub mod config;
pub mod device;
pub mod dqn;
pub mod env;
pub mod eval;
pub mod model;
pub mod optim;
pub mod replay;
pub mod training;
pub mod unreal;

pub use checkpoint::{TrainMeta, load_meta, load_recent_rewards, save_checkpoint, save_recent_rewards};
pub use config::ExperimentConfig;
pub use device::select_device;
pub use dqn::{DeepQConfig, DeepQTrainer};
pub use env::{
    CatchEnv, EnvConfig, Environment, MazeEnv, Observation, StepResult, TimeLimit, make_env,
};
pub use eval::{EvalStats, run_baseline, run_eval};
pub use model::loss::{LossBreakdown, LossInputs};
pub use model::{BaseOutput, ModelConfig, PcOutput, UnrealModel};
pub use replay::{BatchTensors, ReplayBuffer, Transition};
pub use training::{EpisodeStats, RunConfig, RunSummary, StepReport, Trainer, TrainingRunner};
pub use unreal::{ExperienceBuffer, ExperienceFrame, UnrealConfig, UnrealTrainer};
