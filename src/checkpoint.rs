use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::path::Path;

use crate::training::Trainer;

pub const META_FILE: &str = "meta.json";
pub const RECENT_REWARDS_FILE: &str = "recent_rewards.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainMeta {
    /// `None` until an episode has finished.
    #[serde(default)]
    pub best_reward: Option<f64>,
    pub episode: u64,
    pub total_steps: u64,
    pub epsilon: f64,
    pub agent_steps: u64,
}

/// Write the trainer's state files plus `meta.json` into `dir`.
pub fn save_checkpoint<T, P>(trainer: &T, meta: &TrainMeta, dir: P) -> Result<()>
where
    T: Trainer + ?Sized,
    P: AsRef<Path>,
{
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create checkpoint dir {}", dir.display()))?;
    trainer.save(dir)?;

    let file = File::create(dir.join(META_FILE))?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer(writer, meta)?;
    tracing::debug!(dir = %dir.display(), steps = meta.total_steps, "checkpoint saved");
    Ok(())
}

pub fn load_meta<P: AsRef<Path>>(dir: P) -> Result<TrainMeta> {
    let path = dir.as_ref().join(META_FILE);
    let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = std::io::BufReader::new(file);
    let meta = serde_json::from_reader(reader)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(meta)
}

pub fn save_recent_rewards<P: AsRef<Path>>(recent_rewards: &VecDeque<f64>, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let rewards: Vec<f64> = recent_rewards.iter().copied().collect();
    let file = File::create(dir.join(RECENT_REWARDS_FILE))?;
    let writer = std::io::BufWriter::new(file);
    serde_json::to_writer(writer, &rewards)?;
    Ok(())
}

/// Reward window saved alongside a checkpoint. Empty when the file is absent.
pub fn load_recent_rewards<P: AsRef<Path>>(dir: P) -> Result<VecDeque<f64>> {
    let rewards_path = dir.as_ref().join(RECENT_REWARDS_FILE);
    if !rewards_path.exists() {
        return Ok(VecDeque::new());
    }
    let file = File::open(&rewards_path)?;
    let reader = std::io::BufReader::new(file);
    let rewards: Vec<f64> = serde_json::from_reader(reader)?;
    Ok(VecDeque::from(rewards))
}
