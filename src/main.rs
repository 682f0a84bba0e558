// Command line runner for the `vigil_vision` engine, wired to the reference
// models and the image-folder dataset.

use anyhow::Context;
use burn::backend::{Autodiff, NdArray};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_vision::core_modules::dataset::{ImageFolderDataset, SplitKind};
use vigil_vision::core_modules::models::{MeanContextNet, TinyGeneratorConfig};
use vigil_vision::{PipelineConfig, VisionPipeline};

type TrainBackend = Autodiff<NdArray<f32>>;

#[derive(Parser, Debug)]
#[command(
    name = "vigil_vision",
    about = "Predictive video anomaly detection: train, infer, evaluate"
)]
struct Cli {
    /// JSON run configuration.
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the generator over `[epoch_start, epoch_end)`.
    Train {
        #[arg(long, default_value_t = 0)]
        epoch_start: usize,
        #[arg(long)]
        epoch_end: usize,
        /// Resume from the newest checkpoint instead of `--epoch-start`.
        #[arg(long)]
        resume_latest: bool,
    },
    /// Persist the predictions of one checkpoint over a split.
    Infer {
        #[arg(long)]
        epoch: usize,
        #[arg(long, default_value = "test_set")]
        split: String,
    },
    /// Score the test-split predictions of one epoch.
    Evaluate {
        #[arg(long)]
        epoch: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil_vision=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // --- 1. Configuration ---
    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    // --- 2. Model pair and dataset ---
    let device = Default::default();
    let generator = TinyGeneratorConfig::new(config.channels).init::<TrainBackend>(&device);
    let dataset = ImageFolderDataset {
        root: config.dataset_root.clone(),
        image_height: config.image_height,
        image_width: config.image_width,
        channels: config.channels,
        clip_len: config.batch_size,
    };
    let mut pipeline = VisionPipeline::<TrainBackend, _, _, _>::new(
        config,
        generator,
        MeanContextNet::new(),
        dataset,
        device,
    )?;

    // --- 3. Stage ---
    match cli.command {
        Command::Train {
            epoch_start,
            epoch_end,
            resume_latest,
        } => {
            let epoch_start = if resume_latest {
                pipeline.latest_checkpoint()?.unwrap_or(0)
            } else {
                epoch_start
            };
            let started = std::time::Instant::now();
            let report = pipeline.train(epoch_start, epoch_end)?;
            tracing::info!(
                steps = report.optimizer_steps,
                checkpoints = report.checkpoints.len(),
                elapsed_secs = started.elapsed().as_secs(),
                "training run complete"
            );
        }
        Command::Infer { epoch, split } => {
            let split: SplitKind = split.parse()?;
            let path = pipeline.infer(epoch, split)?;
            tracing::info!(path = %path.display(), "predictions written");
        }
        Command::Evaluate { epoch } => {
            let auc = pipeline.evaluate(epoch)?;
            println!(
                "epoch {}: AUC reconstruction = {:.4}, instant = {:.4}, longterm = {:.4}",
                epoch, auc.reconstruction, auc.instant, auc.longterm
            );
        }
    }

    Ok(())
}
