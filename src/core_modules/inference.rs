// THEORY:
// Inference replays a trained generator over every clip of a split and keeps what
// it predicted. The generator handed in is an inner-backend module (the
// `valid()` copy of the trained one), so no autodiff graph can be built here.
//
// Per video, the per-clip outputs are stitched together along time in clip order.
// The three branches travel together as one `PredictionStore`, persisted with
// bincode under a name derived from `(epoch, split)`. Re-running overwrites the
// file, and the same weights on the same split always write the same store.

use crate::core_modules::checkpoint::padded_epoch;
use crate::core_modules::dataset::{SplitKind, VideoSplit};
use crate::core_modules::frames::FrameVolume;
use crate::core_modules::models::FrameGenerator;
use crate::error::{PipelineError, Result};
use burn::tensor::{Tensor, backend::Backend};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Three parallel per-video prediction lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionStore {
    pub reconst: Vec<FrameVolume>,
    pub instant: Vec<FrameVolume>,
    pub longterm: Vec<FrameVolume>,
}

impl PredictionStore {
    pub fn num_videos(&self) -> usize {
        self.reconst.len()
    }

    /// File name of the store for one `(epoch, split)` pair.
    pub fn file_name(epoch: usize, split: SplitKind) -> Result<String> {
        Ok(format!("out_epoch_{}_data_{}.pt", padded_epoch(epoch)?, split))
    }

    pub fn path(output_dir: &Path, epoch: usize, split: SplitKind) -> Result<PathBuf> {
        Ok(output_dir.join(Self::file_name(epoch, split)?))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        tracing::info!(path = %path.display(), videos = self.num_videos(), "predictions saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::MissingPredictions {
                path: path.to_path_buf(),
            });
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}

/// The first batch entry of a `[batch, time, channel, height, width]` tensor.
pub(crate) fn first_in_batch<B: Backend>(tensor: Tensor<B, 5>) -> Result<FrameVolume> {
    let [_, t, c, h, w] = tensor.dims();
    FrameVolume::from_tensor(tensor.slice([0..1, 0..t, 0..c, 0..h, 0..w]).reshape([t, c, h, w]))
}

/// Runs `generator` forward over every clip of `split`.
pub fn run_inference<B, G>(
    generator: &G,
    split: &VideoSplit,
    device: &B::Device,
) -> Result<PredictionStore>
where
    B: Backend,
    G: FrameGenerator<B>,
{
    let mut store = PredictionStore::default();
    let num_videos = split.num_videos();

    for video in 0..num_videos {
        let clips = split.clips(video);
        let mut reconst = Vec::with_capacity(clips.len());
        let mut instant = Vec::with_capacity(clips.len());
        let mut longterm = Vec::with_capacity(clips.len());

        for clip_range in clips {
            let inputs = split.input_tensor::<B>(video, *clip_range, device)?;
            let output = generator.forward(inputs);

            reconst.push(first_in_batch(output.reconstruction)?);
            instant.push(first_in_batch(output.instant)?);
            longterm.push(first_in_batch(output.longterm)?);
        }

        store.reconst.push(FrameVolume::concat(reconst)?);
        store.instant.push(FrameVolume::concat(instant)?);
        store.longterm.push(FrameVolume::concat(longterm)?);
        tracing::info!(
            split = split.name(),
            clips = clips.len(),
            "video {}/{} inferred",
            video + 1,
            num_videos
        );
    }

    tracing::info!(split = split.name(), videos = store.num_videos(), "inference finished");
    Ok(store)
}
