// THEORY:
// Training and inference both walk a two-level hierarchy: videos, then the clips
// inside each video. The `ClipBatcher` owns the first level (which video comes
// next) and hands out the second level untouched (the video's ordered clip list),
// so clip order inside a video is always the order the dataset laid it out in.
//
// Video order is either the split's natural order or a seeded shuffle. The seed
// is an input, so a resumed run that asks for the same epoch gets the same
// sequence back.

use crate::core_modules::dataset::VideoSplit;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A half-open `[start, end)` interval of frames inside one video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipRange {
    pub start: usize,
    pub end: usize,
}

impl ClipRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames fed to the generator: the clip without its last frame.
    pub fn input_frames(&self) -> Range<usize> {
        self.start..self.end - 1
    }
}

impl From<(usize, usize)> for ClipRange {
    fn from((start, end): (usize, usize)) -> Self {
        Self::new(start, end)
    }
}

/// One unit of work handed out by the batcher.
#[derive(Debug, Clone, Copy)]
pub struct VideoClips<'a> {
    pub video_index: usize,
    pub clips: &'a [ClipRange],
}

/// Yields `(video_index, clip list)` pairs for a split.
pub struct ClipBatcher<'a> {
    split: &'a VideoSplit,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a> ClipBatcher<'a> {
    /// Videos in their natural order.
    pub fn sequential(split: &'a VideoSplit) -> Self {
        Self {
            split,
            order: (0..split.num_videos()).collect(),
            cursor: 0,
        }
    }

    /// Videos in an order fixed by `seed`.
    pub fn shuffled(split: &'a VideoSplit, seed: u64) -> Self {
        let mut order: Vec<usize> = (0..split.num_videos()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        Self {
            split,
            order,
            cursor: 0,
        }
    }

    /// The batcher for one training epoch.
    pub fn for_epoch(split: &'a VideoSplit, shuffle: bool, seed: u64, epoch: usize) -> Self {
        if shuffle {
            Self::shuffled(split, seed.wrapping_add(epoch as u64))
        } else {
            Self::sequential(split)
        }
    }

    pub fn video_order(&self) -> &[usize] {
        &self.order
    }
}

impl<'a> Iterator for ClipBatcher<'a> {
    type Item = VideoClips<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let video_index = *self.order.get(self.cursor)?;
        self.cursor += 1;
        Some(VideoClips {
            video_index,
            clips: self.split.clips(video_index),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.order.len() - self.cursor;
        (remaining, Some(remaining))
    }
}
