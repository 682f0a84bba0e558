// THEORY:
// The training loop is a small state machine driven over an epoch range:
//
//   Idle -> EpochActive -> ClipActive (once per clip) -> EpochActive
//        -> Checkpointing -> Visualizing (every `save_every_x_epochs`) -> ... -> Done
//
// Granularity contract: one optimizer step per clip. burn gradients are
// functional: every `backward()` returns a fresh gradient set that is consumed by
// exactly one `optimizer.step`, so nothing leaks from one clip into the next.
//
// The context model only ever gets `&self` and its embedding is detached, so its
// parameters can never move. Every loss term is checked for finiteness before the
// backward pass, and every parameter gradient after it. Either kind of NaN or
// infinity aborts the run before the optimizer can write a poisoned update.
//
// The global step is an explicit counter owned by the trainer. It starts at
// `epoch_start * batches_per_epoch` and moves by one per clip, so a resumed run
// continues the scalar series where the previous one stopped.

use crate::core_modules::checkpoint::{CheckpointManager, padded_epoch};
use crate::core_modules::clip_batcher::ClipBatcher;
use crate::core_modules::dataset::VideoSplit;
use crate::core_modules::inference::first_in_batch;
use crate::core_modules::losses::{LossBundle, LossValues, LossWeights};
use crate::core_modules::models::{ContextModel, FrameGenerator};
use crate::core_modules::scalar_log::ScalarSink;
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::{PipelineError, Result};
use burn::module::{AutodiffModule, Module, ModuleVisitor, ParamId};
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::Tensor;
use burn::tensor::backend::{AutodiffBackend, Backend};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    Idle,
    EpochActive,
    ClipActive,
    Checkpointing,
    Visualizing,
    Done,
}

/// The knobs of one training run.
#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub save_every_x_epochs: usize,
    pub learning_rate: f64,
    pub shuffle: bool,
    pub seed: u64,
    pub loss_weights: LossWeights,
}

impl Default for TrainerSettings {
    fn default() -> Self {
        Self {
            save_every_x_epochs: 5,
            learning_rate: 1e-4,
            shuffle: true,
            seed: 0,
            loss_weights: LossWeights::default(),
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub optimizer_steps: u64,
    /// The global step the next clip would have used.
    pub next_step: u64,
    pub checkpoints: Vec<PathBuf>,
    pub images: Vec<PathBuf>,
    pub last_losses: Option<LossValues>,
}

/// The most recent training clip and what the generator made of it, detached
/// from the autodiff graph.
pub struct LastSample<B: Backend> {
    clip: Tensor<B, 5>,
    reconstruction: Tensor<B, 5>,
    instant: Tensor<B, 5>,
    longterm: Tensor<B, 5>,
}

impl<B: Backend> LastSample<B> {
    /// Renders the 2x5 sample grid and writes it to `path`.
    pub fn save_grid(&self, path: &Path) -> Result<()> {
        let grid = image_helper::sample_grid(
            &first_in_batch(self.clip.clone())?,
            &first_in_batch(self.reconstruction.clone())?,
            &first_in_batch(self.instant.clone())?,
            &first_in_batch(self.longterm.clone())?,
        )?;
        image_helper::save(path, &grid)
    }
}

pub fn sample_image_name(epoch: usize) -> Result<String> {
    Ok(format!("gen_epoch_{}.png", padded_epoch(epoch)?))
}

/// Walks the float parameters of a module and checks their gradients.
struct GradientScan<'g, B: AutodiffBackend> {
    grads: &'g GradientsParams,
    finite: bool,
    backend: PhantomData<B>,
}

impl<'g, B: AutodiffBackend> GradientScan<'g, B> {
    fn all_finite<M: Module<B>>(module: &M, grads: &'g GradientsParams) -> bool {
        let mut scan = Self {
            grads,
            finite: true,
            backend: PhantomData,
        };
        module.visit(&mut scan);
        scan.finite
    }
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientScan<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if !self.finite {
            return;
        }
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.finite = grad.into_data().iter::<f32>().all(f32::is_finite);
        }
    }
}

/// Drives the generator over an epoch range.
pub struct Trainer<'a, B: AutodiffBackend, C: ContextModel<B>, S: ScalarSink> {
    settings: TrainerSettings,
    context: &'a C,
    checkpoints: &'a CheckpointManager,
    image_dir: PathBuf,
    sink: &'a mut S,
    device: B::Device,
    state: TrainerState,
    global_step: u64,
}

impl<'a, B: AutodiffBackend, C: ContextModel<B>, S: ScalarSink> Trainer<'a, B, C, S> {
    pub fn new(
        settings: TrainerSettings,
        context: &'a C,
        checkpoints: &'a CheckpointManager,
        image_dir: impl Into<PathBuf>,
        sink: &'a mut S,
        device: B::Device,
    ) -> Self {
        Self {
            settings,
            context,
            checkpoints,
            image_dir: image_dir.into(),
            sink,
            device,
            state: TrainerState::Idle,
            global_step: 0,
        }
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    fn transition(&mut self, next: TrainerState) {
        tracing::trace!(from = ?self.state, to = ?next, "trainer state");
        self.state = next;
    }

    /// Trains `generator` for epochs `epoch_start..epoch_end` and returns it.
    ///
    /// Checkpoints are named after the number of completed epochs, so the run
    /// ends with `model_epoch_<epoch_end>` on disk.
    pub fn run<G, O>(
        &mut self,
        mut generator: G,
        optimizer: &mut O,
        split: &VideoSplit,
        epoch_start: usize,
        epoch_end: usize,
    ) -> Result<(G, TrainingReport)>
    where
        G: FrameGenerator<B> + AutodiffModule<B>,
        O: Optimizer<G, B>,
    {
        // --- 1. Preconditions ---
        if epoch_end <= epoch_start {
            return Err(PipelineError::InvalidEpochRange {
                start: epoch_start,
                end: epoch_end,
            });
        }
        padded_epoch(epoch_end)?;
        if self.settings.save_every_x_epochs == 0 {
            return Err(PipelineError::Config(
                "save_every_x_epochs must be at least 1".to_string(),
            ));
        }
        self.settings.loss_weights.validate()?;
        let batches_per_epoch = split.num_batches();
        if batches_per_epoch == 0 {
            return Err(PipelineError::EmptySplit(split.name().to_string()));
        }

        self.global_step = (epoch_start * batches_per_epoch) as u64;
        let mut report = TrainingReport::default();
        let mut last_sample: Option<LastSample<B::InnerBackend>> = None;

        tracing::info!(
            epoch_start,
            epoch_end,
            videos = split.num_videos(),
            batches_per_epoch,
            params = generator.num_params(),
            "training started"
        );

        // --- 2. Epoch loop ---
        for epoch in epoch_start..epoch_end {
            self.transition(TrainerState::EpochActive);
            let batcher =
                ClipBatcher::for_epoch(split, self.settings.shuffle, self.settings.seed, epoch);
            tracing::debug!(epoch, order = ?batcher.video_order(), "epoch started");

            for item in batcher {
                for clip_range in item.clips {
                    self.transition(TrainerState::ClipActive);
                    let video = item.video_index;
                    let clip = split.clip_tensor::<B>(video, *clip_range, &self.device)?;
                    let inputs = split.input_tensor::<B>(video, *clip_range, &self.device)?;
                    let (next, losses, sample) =
                        self.train_clip(generator, optimizer, clip, inputs, epoch)?;
                    generator = next;
                    last_sample = Some(sample);
                    report.last_losses = Some(losses);
                    report.optimizer_steps += 1;
                    self.transition(TrainerState::EpochActive);
                }
            }
            self.sink.flush()?;
            if let Some(losses) = report.last_losses {
                tracing::info!(
                    epoch = epoch + 1,
                    epoch_end,
                    context = losses.context,
                    recons = losses.reconstruction,
                    instant = losses.instant,
                    longterm = losses.longterm,
                    "epoch finished"
                );
            }

            // --- 3. Periodic checkpoint and sample grid ---
            let completed = epoch + 1;
            if completed % self.settings.save_every_x_epochs == 0 {
                self.transition(TrainerState::Checkpointing);
                let path = self.checkpoints.save::<B, G>(&generator, completed)?;
                report.checkpoints.push(path);

                self.transition(TrainerState::Visualizing);
                if let Some(sample) = &last_sample {
                    let path = self.image_dir.join(sample_image_name(completed)?);
                    sample.save_grid(&path)?;
                    tracing::info!(path = %path.display(), "sample grid written");
                    report.images.push(path);
                }
            }
        }

        // --- 4. Final save when the last epoch was not a boundary ---
        if epoch_end % self.settings.save_every_x_epochs != 0 {
            self.transition(TrainerState::Checkpointing);
            let path = self.checkpoints.save::<B, G>(&generator, epoch_end)?;
            report.checkpoints.push(path);
        }

        self.transition(TrainerState::Done);
        report.next_step = self.global_step;
        tracing::info!(steps = report.optimizer_steps, "training finished");
        Ok((generator, report))
    }

    fn train_clip<G, O>(
        &mut self,
        generator: G,
        optimizer: &mut O,
        clip: Tensor<B, 5>,
        inputs: Tensor<B, 5>,
        epoch: usize,
    ) -> Result<(G, LossValues, LastSample<B::InnerBackend>)>
    where
        G: FrameGenerator<B> + AutodiffModule<B>,
        O: Optimizer<G, B>,
    {
        let [_, t, c, h, w] = clip.dims();
        let output = generator.forward(inputs);

        let context_target = self
            .context
            .embed(clip.clone().slice([0..1, 0..t, 0..c, 0..h, 0..w]).reshape([t, c, h, w]))
            .detach()
            .unsqueeze_dim::<3>(0);

        let bundle = LossBundle::compute(&output, clip.clone(), context_target);
        let losses = bundle.values();
        if let Some(term) = losses.first_non_finite() {
            return Err(PipelineError::NonFiniteLoss {
                term,
                epoch,
                step: self.global_step,
            });
        }

        let grads = bundle.total(&self.settings.loss_weights).backward();
        let grads = GradientsParams::from_grads(grads, &generator);
        if !GradientScan::<B>::all_finite(&generator, &grads) {
            return Err(PipelineError::NonFiniteGradient {
                epoch,
                step: self.global_step,
            });
        }
        let generator = optimizer.step(self.settings.learning_rate, generator, grads);

        for (tag, value) in losses.tagged() {
            self.sink.add_scalar(tag, value, self.global_step)?;
        }
        tracing::debug!(
            step = self.global_step,
            context = losses.context,
            recons = losses.reconstruction,
            instant = losses.instant,
            longterm = losses.longterm,
            "clip trained"
        );
        self.global_step += 1;

        let sample = LastSample {
            clip: clip.inner(),
            reconstruction: output.reconstruction.inner(),
            instant: output.instant.inner(),
            longterm: output.longterm.inner(),
        };
        Ok((generator, losses, sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::clip_batcher::ClipRange;
    use crate::core_modules::frames::FrameVolume;
    use crate::core_modules::models::test_models::RecordingGenerator;
    use crate::core_modules::models::{MeanContextNet, TinyGenerator, TinyGeneratorConfig};
    use crate::core_modules::scalar_log::MemoryScalarLog;
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn split(videos: usize, frames: usize, clips: Vec<ClipRange>) -> VideoSplit {
        let volumes = (0..videos)
            .map(|v| {
                let values = (0..frames * 16)
                    .map(|i| ((i + v) % 7) as f32 / 3.5 - 1.0)
                    .collect();
                FrameVolume::new([frames, 1, 4, 4], values).unwrap()
            })
            .collect();
        VideoSplit::new("training_set", volumes, vec![clips; videos]).unwrap()
    }

    struct Fixture {
        dir: tempfile::TempDir,
        checkpoints: CheckpointManager,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let checkpoints = CheckpointManager::new(dir.path());
        Fixture { dir, checkpoints }
    }

    fn adam() -> impl Optimizer<TinyGenerator<TestBackend>, TestBackend> {
        AdamConfig::new().init::<TestBackend, TinyGenerator<TestBackend>>()
    }

    fn settings(save_every_x_epochs: usize) -> TrainerSettings {
        TrainerSettings {
            save_every_x_epochs,
            learning_rate: 1e-3,
            shuffle: false,
            ..TrainerSettings::default()
        }
    }

    #[test]
    fn one_optimizer_step_per_clip() {
        let fx = fixture();
        let device = Default::default();
        let split = split(2, 10, vec![ClipRange::new(0, 5), ClipRange::new(5, 10)]);
        let generator = TinyGeneratorConfig::new(1).init::<TestBackend>(&device);
        let mut optimizer = adam();
        let mut sink = MemoryScalarLog::new();
        let context = MeanContextNet::new();

        let mut trainer = Trainer::<TestBackend, _, _>::new(
            settings(1),
            &context,
            &fx.checkpoints,
            fx.dir.path(),
            &mut sink,
            device,
        );
        let (_, report) = trainer.run(generator, &mut optimizer, &split, 0, 2).unwrap();
        assert_eq!(trainer.state(), TrainerState::Done);

        assert_eq!(report.optimizer_steps, 8);
        assert_eq!(report.next_step, 8);
        assert_eq!(report.checkpoints.len(), 2);
        assert_eq!(report.images.len(), 2);
        assert_eq!(sink.steps(), (0..8).collect::<Vec<u64>>());
        assert_eq!(sink.events.len(), 32);
        assert_eq!(sink.series("Loss longterm").len(), 8);
    }

    #[test]
    fn final_save_happens_off_boundary_only() {
        let fx = fixture();
        let device = Default::default();
        let split = split(1, 4, vec![ClipRange::new(0, 4)]);
        let context = MeanContextNet::new();
        let mut sink = MemoryScalarLog::new();
        let mut optimizer = adam();

        let mut trainer = Trainer::<TestBackend, _, _>::new(
            settings(2),
            &context,
            &fx.checkpoints,
            fx.dir.path(),
            &mut sink,
            device,
        );
        let generator = TinyGeneratorConfig::new(1).init::<TestBackend>(&Default::default());
        let (_, report) = trainer.run(generator, &mut optimizer, &split, 0, 3).unwrap();

        let names: Vec<String> = report
            .checkpoints
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["model_epoch_00002.pkl", "model_epoch_00003.pkl"]);
        assert_eq!(report.images.len(), 1);
        assert!(fx.dir.path().join("gen_epoch_00002.png").exists());
        assert!(!fx.dir.path().join("gen_epoch_00003.png").exists());
    }

    #[test]
    fn resumed_runs_continue_the_step_counter() {
        let fx = fixture();
        let device = Default::default();
        let split = split(1, 7, vec![ClipRange::new(0, 4), ClipRange::new(3, 7)]);
        let context = MeanContextNet::new();
        let mut sink = MemoryScalarLog::new();
        let mut optimizer = adam();

        let mut trainer = Trainer::<TestBackend, _, _>::new(
            settings(5),
            &context,
            &fx.checkpoints,
            fx.dir.path(),
            &mut sink,
            device,
        );
        let generator = TinyGeneratorConfig::new(1).init::<TestBackend>(&Default::default());
        trainer.run(generator, &mut optimizer, &split, 3, 4).unwrap();
        assert_eq!(sink.steps(), vec![6, 7]);
    }

    #[test]
    fn empty_epoch_range_is_rejected() {
        let fx = fixture();
        let split = split(1, 4, vec![ClipRange::new(0, 4)]);
        let context = MeanContextNet::new();
        let mut sink = MemoryScalarLog::new();
        let mut optimizer = adam();
        let mut trainer = Trainer::<TestBackend, _, _>::new(
            settings(1),
            &context,
            &fx.checkpoints,
            fx.dir.path(),
            &mut sink,
            Default::default(),
        );
        let generator = TinyGeneratorConfig::new(1).init::<TestBackend>(&Default::default());
        let result = trainer.run(generator, &mut optimizer, &split, 4, 4);
        assert!(matches!(
            result,
            Err(PipelineError::InvalidEpochRange { start: 4, end: 4 })
        ));
        assert_eq!(trainer.state(), TrainerState::Idle);
        assert!(sink.events.is_empty());
    }

    #[test]
    fn non_finite_losses_abort_before_the_update() {
        let fx = fixture();
        let frames = FrameVolume::new([3, 1, 2, 2], vec![f32::NAN; 12]).unwrap();
        let split =
            VideoSplit::new("training_set", vec![frames], vec![vec![ClipRange::new(0, 3)]])
                .unwrap();
        let context = MeanContextNet::new();
        let mut sink = MemoryScalarLog::new();
        let mut optimizer = adam();
        let mut trainer = Trainer::<TestBackend, _, _>::new(
            settings(1),
            &context,
            &fx.checkpoints,
            fx.dir.path(),
            &mut sink,
            Default::default(),
        );
        let generator = TinyGeneratorConfig::new(1).init::<TestBackend>(&Default::default());
        let result = trainer.run(generator, &mut optimizer, &split, 0, 1);
        assert!(matches!(result, Err(PipelineError::NonFiniteLoss { step: 0, .. })));
        assert!(sink.events.is_empty());
        assert_eq!(fx.checkpoints.latest_epoch().unwrap(), None);
    }

    #[test]
    fn non_finite_gradients_abort_before_the_update() {
        let fx = fixture();
        let device = Default::default();
        let split = split(1, 4, vec![ClipRange::new(0, 4)]);
        let context = MeanContextNet::new();
        let mut sink = MemoryScalarLog::new();
        // sqrt(gain) at zero: finite outputs and losses, infinite gradient.
        let (generator, _) = RecordingGenerator::<TestBackend>::new(0.0, &device);
        let mut optimizer =
            AdamConfig::new().init::<TestBackend, RecordingGenerator<TestBackend>>();

        let mut trainer = Trainer::<TestBackend, _, _>::new(
            settings(1),
            &context,
            &fx.checkpoints,
            fx.dir.path(),
            &mut sink,
            device,
        );
        let result = trainer.run(generator, &mut optimizer, &split, 0, 2);
        assert!(matches!(
            result,
            Err(PipelineError::NonFiniteGradient { epoch: 0, step: 0 })
        ));
        assert!(sink.events.is_empty());
        assert_eq!(fx.checkpoints.latest_epoch().unwrap(), None);
    }

    #[test]
    fn generator_sees_each_clip_without_its_last_frame() {
        let fx = fixture();
        let device = Default::default();
        let split = split(1, 7, vec![ClipRange::new(0, 4), ClipRange::new(3, 7)]);
        let context = MeanContextNet::new();
        let mut sink = MemoryScalarLog::new();
        let (generator, seen) = RecordingGenerator::<TestBackend>::new(1.0, &device);
        let mut optimizer =
            AdamConfig::new().init::<TestBackend, RecordingGenerator<TestBackend>>();

        let mut trainer = Trainer::<TestBackend, _, _>::new(
            settings(5),
            &context,
            &fx.checkpoints,
            fx.dir.path(),
            &mut sink,
            device,
        );
        trainer.run(generator, &mut optimizer, &split, 0, 1).unwrap();

        let video = &split.videos()[0];
        let expected: Vec<Vec<f32>> = [0..3, 3..6]
            .into_iter()
            .map(|frames| video.frames(frames).unwrap().values().to_vec())
            .collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[test]
    fn invalid_loss_weights_are_rejected() {
        let fx = fixture();
        let split = split(1, 4, vec![ClipRange::new(0, 4)]);
        let context = MeanContextNet::new();
        let mut sink = MemoryScalarLog::new();
        let mut optimizer = adam();
        let mut settings = settings(1);
        settings.loss_weights.instant = f32::NAN;

        let mut trainer = Trainer::<TestBackend, _, _>::new(
            settings,
            &context,
            &fx.checkpoints,
            fx.dir.path(),
            &mut sink,
            Default::default(),
        );
        let generator = TinyGeneratorConfig::new(1).init::<TestBackend>(&Default::default());
        let result = trainer.run(generator, &mut optimizer, &split, 0, 1);
        assert!(matches!(result, Err(PipelineError::Config(_))));
        assert!(sink.events.is_empty());
    }
}
