use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

use crate::dqn::DeepQConfig;
use crate::env::EnvConfig;
use crate::model::ModelConfig;
use crate::training::RunConfig;
use crate::unreal::UnrealConfig;

/// Every tunable of a run. Missing JSON keys keep their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub env: EnvConfig,
    pub model: ModelConfig,
    pub deepq: DeepQConfig,
    pub unreal: UnrealConfig,
    pub run: RunConfig,
}

impl ExperimentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}
