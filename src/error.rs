// THEORY:
// Every failure in the engine is fatal to the current run: there are no retries.
// The variants below group into configuration errors (caught before any expensive
// work), resume errors (a requested checkpoint or prediction file is missing),
// numerical errors (a non-finite loss term or gradient) and data errors (a clip range or a
// volume that breaks its shape contract). Checkpoints already written stay valid,
// so an operator can fix the cause and resume.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid split name '{0}', expected 'training_set' or 'test_set'")]
    InvalidSplit(String),

    #[error("Invalid scoring parameters: {0}")]
    InvalidScoring(String),

    #[error("Epoch range must be non-empty, got start {start} and end {end}")]
    InvalidEpochRange { start: usize, end: usize },

    #[error("Epoch {0} does not fit in a 5-digit checkpoint name")]
    EpochOutOfRange(usize),

    #[error("Shape mismatch in {context}: expected {expected}, found {found}")]
    ShapeMismatch {
        context: String,
        expected: String,
        found: String,
    },

    #[error("Split '{0}' has no clips to process")]
    EmptySplit(String),

    #[error("Checkpoint file not found: {}", path.display())]
    MissingCheckpoint { path: PathBuf },

    #[error("Prediction file not found: {}", path.display())]
    MissingPredictions { path: PathBuf },

    #[error("Non-finite {term} loss at epoch {epoch}, step {step}")]
    NonFiniteLoss {
        term: &'static str,
        epoch: usize,
        step: u64,
    },

    #[error("Non-finite gradient at epoch {epoch}, step {step}")]
    NonFiniteGradient { epoch: usize, step: u64 },

    #[error("Invalid clip range [{start}, {end}) for video {video} with {frames} frames")]
    InvalidClipRange {
        video: usize,
        start: usize,
        end: usize,
        frames: usize,
    },

    #[error("Invalid frame volume: {0}")]
    InvalidVolume(String),

    #[error("Labels contain a single class ({positives} positive, {negatives} negative)")]
    DegenerateLabels { positives: usize, negatives: usize },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Tensor data error: {0}")]
    Tensor(String),

    #[error("Recorder error: {0}")]
    Recorder(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
