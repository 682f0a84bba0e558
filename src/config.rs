// THEORY:
// One JSON file configures a run. Every field except the run name and the data
// locations has a default, and `validate()` rejects bad values before any model,
// dataset or directory is touched.
//
// All artifacts of a run live under `store_path`:
//   inputs/      cached dataset splits
//   models/      checkpoints
//   gen_images/  training sample grids
//   outputs/     prediction stores and score records
//   log/         scalar log

use crate::core_modules::losses::LossWeights;
use crate::core_modules::scoring::ScoringParams;
use crate::core_modules::trainer::TrainerSettings;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_channels() -> usize {
    3
}

fn default_batch_size() -> usize {
    16
}

fn default_save_every() -> usize {
    5
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_shuffle() -> bool {
    true
}

/// Configuration for the VisionPipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Run name, used for the cached dataset files.
    pub name: String,
    pub store_path: PathBuf,
    pub dataset_root: PathBuf,
    pub image_height: u32,
    pub image_width: u32,
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Frames per clip window.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_save_every")]
    pub save_every_x_epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Shuffle video order every training epoch.
    #[serde(default = "default_shuffle")]
    pub shuffle: bool,
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub loss_weights: LossWeights,
    #[serde(default)]
    pub scoring: ScoringParams,
}

impl PipelineConfig {
    /// A configuration with every optional field at its default.
    pub fn new(
        name: impl Into<String>,
        store_path: impl Into<PathBuf>,
        dataset_root: impl Into<PathBuf>,
        image_height: u32,
        image_width: u32,
    ) -> Self {
        Self {
            name: name.into(),
            store_path: store_path.into(),
            dataset_root: dataset_root.into(),
            image_height,
            image_width,
            channels: default_channels(),
            batch_size: default_batch_size(),
            save_every_x_epochs: default_save_every(),
            learning_rate: default_learning_rate(),
            shuffle: default_shuffle(),
            seed: 0,
            loss_weights: LossWeights::default(),
            scoring: ScoringParams::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Config("name must not be empty".to_string()));
        }
        if self.image_height == 0 || self.image_width == 0 {
            return Err(PipelineError::Config(format!(
                "image size must be positive, got {}x{}",
                self.image_height, self.image_width
            )));
        }
        if self.channels != 1 && self.channels != 3 {
            return Err(PipelineError::Config(format!(
                "channels must be 1 or 3, got {}",
                self.channels
            )));
        }
        if self.batch_size < 2 {
            return Err(PipelineError::Config(format!(
                "batch_size must be at least 2 frames, got {}",
                self.batch_size
            )));
        }
        if self.save_every_x_epochs == 0 {
            return Err(PipelineError::Config(
                "save_every_x_epochs must be at least 1".to_string(),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(PipelineError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        self.loss_weights.validate()?;
        self.scoring.validate()?;
        Ok(())
    }

    pub fn trainer_settings(&self) -> TrainerSettings {
        TrainerSettings {
            save_every_x_epochs: self.save_every_x_epochs,
            learning_rate: self.learning_rate,
            shuffle: self.shuffle,
            seed: self.seed,
            loss_weights: self.loss_weights,
        }
    }
}

/// The directory layout of one run.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub inputs: PathBuf,
    pub models: PathBuf,
    pub gen_images: PathBuf,
    pub outputs: PathBuf,
    pub log: PathBuf,
    pub training_data: PathBuf,
    pub evaluation_data: PathBuf,
}

impl StorePaths {
    pub fn new(store_path: &Path, name: &str) -> Self {
        let inputs = store_path.join("inputs");
        Self {
            training_data: inputs.join(format!("{}_training.bin", name)),
            evaluation_data: inputs.join(format!("{}_evaluation.bin", name)),
            inputs,
            models: store_path.join("models"),
            gen_images: store_path.join("gen_images"),
            outputs: store_path.join("outputs"),
            log: store_path.join("log"),
        }
    }

    pub fn create_all(&self) -> Result<()> {
        for dir in [&self.inputs, &self.models, &self.gen_images, &self.outputs, &self.log] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
