// THEORY:
// The dataset layer is the engine's only window onto video data. It answers three
// questions and nothing else:
// 1.  **What frames exist?** A `VideoSplit` holds every video of one split as a
//     `FrameVolume`, already resized and normalized to `[-1, 1]`.
// 2.  **How is each video cut into clips?** The split carries a validated clip
//     layout per video. The default "chained" layout starts every window on the
//     last frame of the previous one, so per-clip outputs (window length minus one
//     frame each) concatenate to exactly `frames - 1` frames and line up with the
//     ground truth at evaluation time.
// 3.  **What is the ground truth?** Optional per-frame anomaly labels. Scored
//     slice `k` (the transition from frame `k` to `k + 1`) carries the label of
//     frame `k + 1`.
//
// Where the frames come from is the provider's business. `ImageFolderDataset`
// reads one folder of images per video and caches the built split with bincode;
// `InMemoryDataset` serves splits that were built elsewhere.

use crate::core_modules::clip_batcher::ClipRange;
use crate::core_modules::evaluation;
use crate::core_modules::frames::FrameVolume;
use crate::error::{PipelineError, Result};
use burn::tensor::{Tensor, backend::Backend};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const LABEL_EXTENSION: &str = "labels";

/// The two dataset splits the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitKind {
    Training,
    Test,
}

impl SplitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitKind::Training => "training_set",
            SplitKind::Test => "test_set",
        }
    }
}

impl fmt::Display for SplitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplitKind {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "training_set" => Ok(SplitKind::Training),
            "test_set" => Ok(SplitKind::Test),
            other => Err(PipelineError::InvalidSplit(other.to_string())),
        }
    }
}

/// All videos of one split, their clip layout and optional ground truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSplit {
    name: String,
    videos: Vec<FrameVolume>,
    clips: Vec<Vec<ClipRange>>,
    labels: Option<Vec<Vec<bool>>>,
}

impl VideoSplit {
    /// Builds a split with an explicit clip layout, one clip list per video.
    pub fn new(
        name: impl Into<String>,
        videos: Vec<FrameVolume>,
        clips: Vec<Vec<ClipRange>>,
    ) -> Result<Self> {
        let name = name.into();
        if videos.len() != clips.len() {
            return Err(PipelineError::ShapeMismatch {
                context: format!("clip layout of split '{}'", name),
                expected: format!("{} clip lists", videos.len()),
                found: format!("{} clip lists", clips.len()),
            });
        }
        if let Some(first) = videos.first() {
            let frame_shape = first.frame_shape();
            if let Some(other) = videos.iter().find(|v| v.frame_shape() != frame_shape) {
                return Err(PipelineError::ShapeMismatch {
                    context: format!("frames of split '{}'", name),
                    expected: format!("{:?}", frame_shape),
                    found: format!("{:?}", other.frame_shape()),
                });
            }
        }
        for (video, (volume, layout)) in videos.iter().zip(&clips).enumerate() {
            if layout.is_empty() {
                return Err(PipelineError::Dataset(format!(
                    "video {} of split '{}' has no clips",
                    video, name
                )));
            }
            for clip in layout {
                if clip.end < clip.start + 2 || clip.end > volume.num_frames() {
                    return Err(PipelineError::InvalidClipRange {
                        video,
                        start: clip.start,
                        end: clip.end,
                        frames: volume.num_frames(),
                    });
                }
            }
        }
        Ok(Self {
            name,
            videos,
            clips,
            labels: None,
        })
    }

    /// Builds a split whose clips are chained windows of `clip_len` frames.
    pub fn chained(
        name: impl Into<String>,
        videos: Vec<FrameVolume>,
        clip_len: usize,
    ) -> Result<Self> {
        let clips = videos
            .iter()
            .map(|video| chained_layout(video.num_frames(), clip_len))
            .collect::<Result<Vec<_>>>()?;
        Self::new(name, videos, clips)
    }

    /// Attaches per-frame anomaly labels, one list per video.
    pub fn with_labels(mut self, labels: Vec<Vec<bool>>) -> Result<Self> {
        if labels.len() != self.videos.len() {
            return Err(PipelineError::ShapeMismatch {
                context: format!("labels of split '{}'", self.name),
                expected: format!("{} videos", self.videos.len()),
                found: format!("{} videos", labels.len()),
            });
        }
        for (video, (volume, frame_labels)) in self.videos.iter().zip(&labels).enumerate() {
            if volume.num_frames() != frame_labels.len() {
                return Err(PipelineError::ShapeMismatch {
                    context: format!("labels of video {} in split '{}'", video, self.name),
                    expected: format!("{} frames", volume.num_frames()),
                    found: format!("{} labels", frame_labels.len()),
                });
            }
        }
        self.labels = Some(labels);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_videos(&self) -> usize {
        self.videos.len()
    }

    pub fn videos(&self) -> &[FrameVolume] {
        &self.videos
    }

    pub fn video(&self, index: usize) -> Option<&FrameVolume> {
        self.videos.get(index)
    }

    /// The ordered clip list of video `index`; empty for an unknown video.
    pub fn clips(&self, index: usize) -> &[ClipRange] {
        self.clips.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of clips over all videos: the batches of one epoch.
    pub fn num_batches(&self) -> usize {
        self.clips.iter().map(Vec::len).sum()
    }

    pub fn frame_shape(&self) -> Option<[usize; 3]> {
        self.videos.first().map(FrameVolume::frame_shape)
    }

    /// The frames of one clip as a `[1, time, channel, height, width]` tensor.
    pub fn clip_tensor<B: Backend>(
        &self,
        video: usize,
        clip: ClipRange,
        device: &B::Device,
    ) -> Result<Tensor<B, 5>> {
        let volume = self.checked_clip(video, clip)?;
        Ok(batched(volume.frames(clip.start..clip.end)?, device))
    }

    /// The frames the generator sees for one clip: all but the last.
    pub fn input_tensor<B: Backend>(
        &self,
        video: usize,
        clip: ClipRange,
        device: &B::Device,
    ) -> Result<Tensor<B, 5>> {
        let volume = self.checked_clip(video, clip)?;
        Ok(batched(volume.frames(clip.input_frames())?, device))
    }

    fn checked_clip(&self, video: usize, clip: ClipRange) -> Result<&FrameVolume> {
        let volume = self.videos.get(video).ok_or_else(|| {
            PipelineError::Dataset(format!("split '{}' has no video {}", self.name, video))
        })?;
        if clip.end < clip.start + 2 || clip.end > volume.num_frames() {
            return Err(PipelineError::InvalidClipRange {
                video,
                start: clip.start,
                end: clip.end,
                frames: volume.num_frames(),
            });
        }
        Ok(volume)
    }

    pub fn frame_labels(&self) -> Option<&[Vec<bool>]> {
        self.labels.as_deref()
    }

    /// One label per scored slice: slice `k` is labelled by frame `k + 1`.
    pub fn slice_labels(&self) -> Result<Vec<Vec<bool>>> {
        let labels = self.labels.as_ref().ok_or_else(|| {
            PipelineError::Dataset(format!("split '{}' has no ground-truth labels", self.name))
        })?;
        Ok(labels
            .iter()
            .map(|frames| frames.iter().skip(1).copied().collect())
            .collect())
    }

    /// Area under the ROC curve of per-video slice scores against this split's labels.
    pub fn evaluate(&self, per_video_scores: &[Vec<f32>]) -> Result<f64> {
        let labels = self.slice_labels()?;
        evaluation::pooled_auc(per_video_scores, &labels)
    }
}

fn batched<B: Backend>(frames: FrameVolume, device: &B::Device) -> Tensor<B, 5> {
    frames.to_tensor::<B>(device).unsqueeze_dim::<5>(0)
}

/// Windows of `clip_len` frames, each starting on the last frame of the previous one.
pub fn chained_layout(frames: usize, clip_len: usize) -> Result<Vec<ClipRange>> {
    if clip_len < 2 {
        return Err(PipelineError::Config(format!(
            "clip length must be at least 2 frames, got {}",
            clip_len
        )));
    }
    if frames < 2 {
        return Err(PipelineError::InvalidVolume(format!(
            "a video needs at least 2 frames to be cut into clips, got {}",
            frames
        )));
    }
    let mut layout = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + clip_len).min(frames);
        layout.push(ClipRange::new(start, end));
        if end == frames {
            return Ok(layout);
        }
        start = end - 1;
    }
}

/// The engine's view of a dataset: it can produce a training and an evaluation split.
pub trait DatasetProvider {
    /// Loads the training split, using `cache` as the provider sees fit.
    fn load_training_data(&self, cache: &Path) -> Result<VideoSplit>;

    /// Loads the evaluation split, with ground-truth labels.
    fn load_evaluation_data(&self, cache: &Path) -> Result<VideoSplit>;
}

/// Serves splits that were built elsewhere.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    pub training: VideoSplit,
    pub evaluation: VideoSplit,
}

impl InMemoryDataset {
    pub fn new(training: VideoSplit, evaluation: VideoSplit) -> Self {
        Self {
            training,
            evaluation,
        }
    }
}

impl DatasetProvider for InMemoryDataset {
    fn load_training_data(&self, _cache: &Path) -> Result<VideoSplit> {
        Ok(self.training.clone())
    }

    fn load_evaluation_data(&self, _cache: &Path) -> Result<VideoSplit> {
        Ok(self.evaluation.clone())
    }
}

/// Reads `<root>/training/<video>/*` and `<root>/testing/<video>/*` image folders.
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    pub root: PathBuf,
    pub image_height: u32,
    pub image_width: u32,
    pub channels: usize,
    pub clip_len: usize,
}

impl ImageFolderDataset {
    fn load_cached_or_build(
        &self,
        cache: &Path,
        folder: &str,
        split: SplitKind,
    ) -> Result<VideoSplit> {
        if cache.exists() {
            tracing::info!(cache = %cache.display(), "loading cached {} split", split);
            let reader = BufReader::new(File::open(cache)?);
            let cached: VideoSplit = bincode::deserialize_from(reader)?;
            return Ok(cached);
        }

        let built = self.build_split(folder, split)?;
        let mut writer = BufWriter::new(File::create(cache)?);
        bincode::serialize_into(&mut writer, &built)?;
        writer.flush()?;
        tracing::info!(
            cache = %cache.display(),
            videos = built.num_videos(),
            clips = built.num_batches(),
            "built and cached {} split",
            split
        );
        Ok(built)
    }

    fn build_split(&self, folder: &str, split: SplitKind) -> Result<VideoSplit> {
        let split_dir = self.root.join(folder);
        let video_dirs = sorted_entries(&split_dir, |path| path.is_dir())?;
        if video_dirs.is_empty() {
            return Err(PipelineError::Dataset(format!(
                "no video folders under {}",
                split_dir.display()
            )));
        }

        let mut videos = Vec::with_capacity(video_dirs.len());
        for video_dir in &video_dirs {
            videos.push(self.load_video(video_dir)?);
        }
        let mut built = VideoSplit::chained(split.as_str(), videos, self.clip_len)?;

        if split == SplitKind::Test {
            let labels = video_dirs
                .iter()
                .map(|dir| read_labels(&dir.with_extension(LABEL_EXTENSION)))
                .collect::<Result<Vec<_>>>()?;
            built = built.with_labels(labels)?;
        }
        Ok(built)
    }

    fn load_video(&self, video_dir: &Path) -> Result<FrameVolume> {
        let frame_paths = sorted_entries(video_dir, |path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })?;

        let mut frames = Vec::with_capacity(frame_paths.len());
        for path in &frame_paths {
            let image = image::open(path)?.resize_exact(
                self.image_width,
                self.image_height,
                FilterType::Triangle,
            );
            let raw = match self.channels {
                1 => image.to_luma8().into_raw(),
                3 => image.to_rgb8().into_raw(),
                other => {
                    return Err(PipelineError::Config(format!(
                        "unsupported channel count {}",
                        other
                    )));
                }
            };
            frames.push(interleaved_to_planar(&raw, self.channels));
        }
        FrameVolume::from_frames(
            [self.channels, self.image_height as usize, self.image_width as usize],
            frames,
        )
    }
}

impl DatasetProvider for ImageFolderDataset {
    fn load_training_data(&self, cache: &Path) -> Result<VideoSplit> {
        self.load_cached_or_build(cache, "training", SplitKind::Training)
    }

    fn load_evaluation_data(&self, cache: &Path) -> Result<VideoSplit> {
        self.load_cached_or_build(cache, "testing", SplitKind::Test)
    }
}

/// Interleaved 8-bit pixels to channel-major values normalized to `[-1, 1]`.
fn interleaved_to_planar(raw: &[u8], channels: usize) -> Vec<f32> {
    let pixels = raw.len() / channels;
    let mut planar = vec![0.0; raw.len()];
    for (index, value) in raw.iter().enumerate() {
        let channel = index % channels;
        let pixel = index / channels;
        planar[channel * pixels + pixel] = *value as f32 / 127.5 - 1.0;
    }
    planar
}

fn sorted_entries(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if keep(&path) {
            entries.push(path);
        }
    }
    entries.sort();
    Ok(entries)
}

fn read_labels(path: &Path) -> Result<Vec<bool>> {
    if !path.exists() {
        return Err(PipelineError::Dataset(format!(
            "missing label file {}",
            path.display()
        )));
    }
    std::fs::read_to_string(path)?
        .split_whitespace()
        .map(|token| match token {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(PipelineError::Dataset(format!(
                "invalid label '{}' in {}",
                other,
                path.display()
            ))),
        })
        .collect()
}
