// THEORY:
// The internal layers of the engine, leaf-first: host-side frames and datasets,
// the clip batcher, the model interfaces and their losses, then the three
// consumers of all of that (training, inference, scoring and evaluation).

pub mod checkpoint;
pub mod clip_batcher;
pub mod dataset;
pub mod evaluation;
pub mod frames;
pub mod inference;
pub mod losses;
pub mod models;
pub mod scalar_log;
pub mod scoring;
pub mod trainer;
pub mod utils;
