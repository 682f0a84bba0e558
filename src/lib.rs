// THEORY:
// This file is the entry point of the `vigil_vision` library crate. It exposes
// the `VisionPipeline` and its configuration as the high-level interface for
// training, inference and anomaly evaluation. The internal layers in
// `core_modules` stay public so custom generators, context models and dataset
// providers can plug in through their traits.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use config::{PipelineConfig, StorePaths};
pub use error::{PipelineError, Result};
pub use pipeline::{BranchAuc, ScoreReport, VisionPipeline};
