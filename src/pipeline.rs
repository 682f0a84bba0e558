// THEORY:
// The `pipeline` module is the top-level API of the engine. A `VisionPipeline`
// owns one run: its configuration, its directory layout, the model pair and the
// dataset provider. It exposes the three stages of the workflow, each of which
// is a separate, non-overlapping invocation:
//
// 1.  **Train**: fit the generator over an epoch range, optionally resuming from
//     the checkpoint of `epoch_start`.
// 2.  **Infer**: replay the checkpoint of one epoch over a split and persist the
//     per-video predictions.
// 3.  **Evaluate**: turn the test-split predictions of one epoch into per-slice
//     patch scores and one AUC per prediction branch.
//
// Training runs on an autodiff backend; inference and scoring run on its inner
// backend through `AutodiffModule::valid()`.

use crate::config::{PipelineConfig, StorePaths};
use crate::core_modules::checkpoint::{CheckpointManager, padded_epoch};
use crate::core_modules::dataset::{DatasetProvider, SplitKind, VideoSplit};
use crate::core_modules::evaluation::evaluate_branches;
use crate::core_modules::frames::FrameVolume;
use crate::core_modules::inference::{PredictionStore, run_inference};
use crate::core_modules::models::{ContextModel, FrameGenerator};
use crate::core_modules::scalar_log::{JsonlScalarLog, ScalarSink};
use crate::core_modules::scoring::{PatchScore, ScoringParams, score_frames};
use crate::core_modules::trainer::{Trainer, TrainingReport};
use crate::error::{PipelineError, Result};
use burn::module::AutodiffModule;
use burn::optim::AdamConfig;
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

// Re-export key data structures for the public API.
pub use crate::core_modules::evaluation::{BranchAuc, BranchScores};

/// Everything evaluation produced for one epoch, as written next to the predictions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreReport {
    pub epoch: usize,
    pub scoring: ScoringParams,
    pub reconstruction: Vec<Vec<PatchScore>>,
    pub instant: Vec<Vec<PatchScore>>,
    pub longterm: Vec<Vec<PatchScore>>,
    pub auc: BranchAuc,
}

impl ScoreReport {
    pub fn file_name(epoch: usize) -> Result<String> {
        Ok(format!("scores_epoch_{}.json", padded_epoch(epoch)?))
    }

    fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

/// The main, top-level struct for the engine.
pub struct VisionPipeline<B, G, C, D>
where
    B: AutodiffBackend,
    G: FrameGenerator<B> + AutodiffModule<B>,
    G::InnerModule: FrameGenerator<B::InnerBackend>,
    C: ContextModel<B>,
    D: DatasetProvider,
{
    config: PipelineConfig,
    paths: StorePaths,
    checkpoints: CheckpointManager,
    generator: G,
    context: C,
    dataset: D,
    device: B::Device,
}

impl<B, G, C, D> VisionPipeline<B, G, C, D>
where
    B: AutodiffBackend,
    G: FrameGenerator<B> + AutodiffModule<B>,
    G::InnerModule: FrameGenerator<B::InnerBackend>,
    C: ContextModel<B>,
    D: DatasetProvider,
{
    /// Validates `config` and creates the run's directory layout.
    pub fn new(
        config: PipelineConfig,
        generator: G,
        context: C,
        dataset: D,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;
        let paths = StorePaths::new(&config.store_path, &config.name);
        paths.create_all()?;
        tracing::info!(
            name = %config.name,
            store = %config.store_path.display(),
            params = generator.num_params(),
            "pipeline ready"
        );
        Ok(Self {
            checkpoints: CheckpointManager::new(paths.models.clone()),
            config,
            paths,
            generator,
            context,
            dataset,
            device,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// The newest epoch with a checkpoint on disk.
    pub fn latest_checkpoint(&self) -> Result<Option<usize>> {
        self.checkpoints.latest_epoch()
    }

    /// Trains with scalars appended to the run's `log/scalars.jsonl`.
    pub fn train(&mut self, epoch_start: usize, epoch_end: usize) -> Result<TrainingReport> {
        let mut sink = JsonlScalarLog::open(&self.paths.log)?;
        tracing::info!(path = %sink.path().display(), "scalar log opened");
        self.train_with_sink(epoch_start, epoch_end, &mut sink)
    }

    pub fn train_with_sink<S: ScalarSink>(
        &mut self,
        epoch_start: usize,
        epoch_end: usize,
        sink: &mut S,
    ) -> Result<TrainingReport> {
        // --- 1. Preconditions and resume ---
        if epoch_end <= epoch_start {
            return Err(PipelineError::InvalidEpochRange {
                start: epoch_start,
                end: epoch_end,
            });
        }
        let mut generator = self.generator.clone();
        if epoch_start > 0 {
            generator = self.checkpoints.load::<B, G>(generator, epoch_start, &self.device)?;
        }

        // --- 2. Data and optimizer ---
        let split = self.dataset.load_training_data(&self.paths.training_data)?;
        let mut optimizer = AdamConfig::new().init::<B, G>();

        // --- 3. Run ---
        let (generator, report) = {
            let mut trainer = Trainer::<B, C, S>::new(
                self.config.trainer_settings(),
                &self.context,
                &self.checkpoints,
                self.paths.gen_images.clone(),
                sink,
                self.device.clone(),
            );
            trainer.run(generator, &mut optimizer, &split, epoch_start, epoch_end)?
        };
        self.generator = generator;
        Ok(report)
    }

    fn load_split(&self, split: SplitKind) -> Result<VideoSplit> {
        match split {
            SplitKind::Training => self.dataset.load_training_data(&self.paths.training_data),
            SplitKind::Test => self.dataset.load_evaluation_data(&self.paths.evaluation_data),
        }
    }

    /// Runs the checkpoint of `epoch` over `split` and persists its predictions.
    pub fn infer(&self, epoch: usize, split: SplitKind) -> Result<PathBuf> {
        let path = PredictionStore::path(&self.paths.outputs, epoch, split)?;
        let model = self
            .checkpoints
            .load::<B, G>(self.generator.clone(), epoch, &self.device)?
            .valid();
        let data = self.load_split(split)?;

        tracing::info!(epoch, split = %split, videos = data.num_videos(), "inference started");
        let store = run_inference::<B::InnerBackend, G::InnerModule>(&model, &data, &self.device)?;
        store.save(&path)?;
        Ok(path)
    }

    /// Scores the test-split predictions of `epoch` and computes one AUC per branch.
    pub fn evaluate(&self, epoch: usize) -> Result<BranchAuc> {
        // --- 1. Ground truth and predictions ---
        let truth = self.dataset.load_evaluation_data(&self.paths.evaluation_data)?;
        let store_path = PredictionStore::path(&self.paths.outputs, epoch, SplitKind::Test)?;
        let store = PredictionStore::load(&store_path)?;
        check_store_against(&truth, &store)?;

        // --- 2. Patch scores per branch ---
        let params = self.config.scoring;
        let mut report = ScoreReport {
            epoch,
            scoring: params,
            reconstruction: Vec::with_capacity(truth.num_videos()),
            instant: Vec::with_capacity(truth.num_videos()),
            longterm: Vec::with_capacity(truth.num_videos()),
            auc: BranchAuc {
                reconstruction: 0.0,
                instant: 0.0,
                longterm: 0.0,
            },
        };
        for (index, video) in truth.videos().iter().enumerate() {
            let frames = video.num_frames();
            let inputs = video.frames(0..frames - 1)?;
            let targets = video.frames(1..frames)?;

            report.reconstruction.push(self.score(&store.reconst[index], &inputs, &params)?);
            report.instant.push(self.score(&store.instant[index], &targets, &params)?);
            report.longterm.push(self.score(&store.longterm[index], &targets, &params)?);
        }

        // --- 3. AUC against slice labels ---
        let scores = BranchScores {
            reconstruction: only_scores(&report.reconstruction),
            instant: only_scores(&report.instant),
            longterm: only_scores(&report.longterm),
        };
        let labels = truth.slice_labels()?;
        report.auc = evaluate_branches(&scores, &labels, |branch| truth.evaluate(branch))?;

        let path = self.paths.outputs.join(ScoreReport::file_name(epoch)?);
        report.save(&path)?;
        tracing::info!(
            epoch,
            reconstruction = report.auc.reconstruction,
            instant = report.auc.instant,
            longterm = report.auc.longterm,
            path = %path.display(),
            "evaluation finished"
        );
        Ok(report.auc)
    }

    fn score(
        &self,
        predicted: &FrameVolume,
        actual: &FrameVolume,
        params: &ScoringParams,
    ) -> Result<Vec<PatchScore>> {
        let diff = predicted.to_tensor::<B::InnerBackend>(&self.device)
            - actual.to_tensor::<B::InnerBackend>(&self.device);
        score_frames(diff, params)
    }
}

fn only_scores(records: &[Vec<PatchScore>]) -> Vec<Vec<f32>> {
    records
        .iter()
        .map(|video| video.iter().map(|patch| patch.score).collect())
        .collect()
}

/// Every branch must hold one volume per video, one frame per scored slice.
fn check_store_against(truth: &VideoSplit, store: &PredictionStore) -> Result<()> {
    let branches = [
        ("reconstruction", &store.reconst),
        ("instant", &store.instant),
        ("longterm", &store.longterm),
    ];
    for (branch, volumes) in branches {
        if volumes.len() != truth.num_videos() {
            return Err(PipelineError::ShapeMismatch {
                context: format!("{} predictions", branch),
                expected: format!("{} videos", truth.num_videos()),
                found: format!("{} videos", volumes.len()),
            });
        }
        for (index, (volume, video)) in volumes.iter().zip(truth.videos()).enumerate() {
            let [frames, c, h, w] = video.shape();
            let expected = [frames.saturating_sub(1), c, h, w];
            if volume.shape() != expected {
                return Err(PipelineError::ShapeMismatch {
                    context: format!("{} predictions of video {}", branch, index),
                    expected: format!("{:?}", expected),
                    found: format!("{:?}", volume.shape()),
                });
            }
        }
    }
    Ok(())
}
