// THEORY:
// The scoring engine localizes prediction error. Its input is a difference volume,
// `[frames, channel, height, width]`, between predicted and real frames.
//
// Algorithm steps:
// 1.  **Channel Combination**: each frame collapses into one 2D error map, either
//     the sum of absolute channel differences or the sum of their squares.
// 2.  **Patch Aggregation**: the map is convolved with an all-ones
//     `patch_size x patch_size` kernel (stride 1, zero "same" padding). Every cell
//     of the result is the total error of the patch centred on it.
// 3.  **Peak Selection**: the frame's anomaly score is the largest patch total, and
//     its position the patch centre (the first one in row-major order on ties).
//
// The engine is a pure function: same volume and parameters, same output.

use crate::error::{PipelineError, Result};
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::{Tensor, backend::Backend};
use serde::{Deserialize, Serialize};

/// How channel differences combine into one error value per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChannelCombine {
    /// Sum of absolute values (power 1).
    Absolute,
    /// Sum of squares (power 2).
    Squared,
}

impl TryFrom<u8> for ChannelCombine {
    type Error = PipelineError;

    fn try_from(power: u8) -> Result<Self> {
        match power {
            1 => Ok(ChannelCombine::Absolute),
            2 => Ok(ChannelCombine::Squared),
            other => Err(PipelineError::InvalidScoring(format!(
                "power must be 1 or 2, got {}",
                other
            ))),
        }
    }
}

impl From<ChannelCombine> for u8 {
    fn from(combine: ChannelCombine) -> Self {
        match combine {
            ChannelCombine::Absolute => 1,
            ChannelCombine::Squared => 2,
        }
    }
}

fn default_power() -> ChannelCombine {
    ChannelCombine::Absolute
}

fn default_patch_size() -> usize {
    5
}

/// Parameters of the scoring engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoringParams {
    #[serde(default = "default_power")]
    pub power: ChannelCombine,
    /// Side of the square patch; a positive odd number.
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            power: default_power(),
            patch_size: default_patch_size(),
        }
    }
}

impl ScoringParams {
    pub fn new(power: u8, patch_size: usize) -> Result<Self> {
        let params = Self {
            power: ChannelCombine::try_from(power)?,
            patch_size,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.patch_size % 2 == 0 {
            return Err(PipelineError::InvalidScoring(format!(
                "patch size must be a positive odd number, got {}",
                self.patch_size
            )));
        }
        Ok(())
    }

    fn check_map(&self, height: usize, width: usize) -> Result<()> {
        self.validate()?;
        if self.patch_size > height || self.patch_size > width {
            return Err(PipelineError::InvalidScoring(format!(
                "patch size {} exceeds the {}x{} error map",
                self.patch_size, height, width
            )));
        }
        Ok(())
    }
}

/// The anomaly score of one frame and the centre of its most salient patch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatchScore {
    pub score: f32,
    /// `(row, col)` of the patch centre.
    pub position: (usize, usize),
}

/// Collapses the channels of a `[frames, channel, height, width]` volume into
/// `[frames, 1, height, width]` error maps.
pub fn error_maps<B: Backend>(diff: Tensor<B, 4>, power: ChannelCombine) -> Tensor<B, 4> {
    let combined = match power {
        ChannelCombine::Absolute => diff.abs(),
        ChannelCombine::Squared => diff.powf_scalar(2.0),
    };
    combined.sum_dim(1)
}

/// Windowed patch sums of each frame's error map, same size as the map.
pub fn patch_heatmaps<B: Backend>(
    diff: Tensor<B, 4>,
    params: &ScoringParams,
) -> Result<Tensor<B, 4>> {
    let [_, _, height, width] = diff.dims();
    params.check_map(height, width)?;

    let device = diff.device();
    let maps = error_maps(diff, params.power);
    let kernel = Tensor::<B, 4>::ones([1, 1, params.patch_size, params.patch_size], &device);
    let padding = params.patch_size / 2;
    let options = ConvOptions::new([1, 1], [padding, padding], [1, 1], 1);
    Ok(conv2d(maps, kernel, None, options))
}

/// Scores every frame of a difference volume.
pub fn score_frames<B: Backend>(
    diff: Tensor<B, 4>,
    params: &ScoringParams,
) -> Result<Vec<PatchScore>> {
    let [frames, _, height, width] = diff.dims();
    if frames == 0 {
        params.validate()?;
        return Ok(Vec::new());
    }

    let heatmaps = patch_heatmaps(diff, params)?;
    let values = heatmaps
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| PipelineError::Tensor(format!("{:?}", err)))?;

    Ok(values
        .chunks(height * width)
        .map(|heatmap| {
            let (mut best_index, mut best) = (0, heatmap[0]);
            for (index, value) in heatmap.iter().enumerate().skip(1) {
                if *value > best {
                    best = *value;
                    best_index = index;
                }
            }
            PatchScore {
                score: best,
                position: (best_index / width, best_index % width),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData;

    type TestBackend = burn::backend::NdArray<f32>;

    fn volume(shape: [usize; 4], values: Vec<f32>) -> Tensor<TestBackend, 4> {
        Tensor::from_data(TensorData::new(values, shape), &Default::default())
    }

    fn single_hot(value: f32, row: usize, col: usize) -> Tensor<TestBackend, 4> {
        let mut values = vec![0.0; 7 * 7];
        values[row * 7 + col] = value;
        volume([1, 1, 7, 7], values)
    }

    #[test]
    fn zero_volume_scores_zero_for_every_setting() {
        for power in [1, 2] {
            for patch_size in [1, 3, 5] {
                let params = ScoringParams::new(power, patch_size).unwrap();
                let scores =
                    score_frames(volume([3, 2, 6, 6], vec![0.0; 3 * 2 * 36]), &params).unwrap();
                assert_eq!(scores.len(), 3);
                assert!(scores.iter().all(|s| s.score == 0.0));
            }
        }
    }

    #[test]
    fn hot_pixel_is_localized_at_first_covering_patch() {
        let params = ScoringParams::new(1, 3).unwrap();
        let scores = score_frames(single_hot(-2.0, 2, 3), &params).unwrap();
        assert_eq!(scores[0].score, 2.0);
        // Every patch centre within one cell of (2, 3) ties; the first in row-major order wins.
        assert_eq!(scores[0].position, (1, 2));
    }

    #[test]
    fn patch_size_one_is_the_raw_peak() {
        let params = ScoringParams::new(2, 1).unwrap();
        let scores = score_frames(single_hot(3.0, 4, 5), &params).unwrap();
        assert_eq!(scores[0].score, 9.0);
        assert_eq!(scores[0].position, (4, 5));
    }

    #[test]
    fn channels_combine_by_power() {
        // One pixel with channel differences -1 and 2.
        let mut values = vec![0.0; 2 * 3 * 3];
        values[4] = -1.0;
        values[9 + 4] = 2.0;
        let absolute_params = ScoringParams::new(1, 1).unwrap();
        let squared_params = ScoringParams::new(2, 1).unwrap();
        let absolute =
            score_frames(volume([1, 2, 3, 3], values.clone()), &absolute_params).unwrap();
        let squared = score_frames(volume([1, 2, 3, 3], values), &squared_params).unwrap();
        assert_eq!(absolute[0].score, 3.0);
        assert_eq!(squared[0].score, 5.0);
    }

    #[test]
    fn uniform_error_peaks_at_first_interior_patch() {
        let params = ScoringParams::new(1, 5).unwrap();
        let scores = score_frames(volume([1, 1, 8, 8], vec![0.5; 64]), &params).unwrap();
        assert_eq!(scores[0].score, 12.5);
        assert_eq!(scores[0].position, (2, 2));
    }

    #[test]
    fn larger_deviation_scores_higher_in_both_modes() {
        for power in [1, 2] {
            let params = ScoringParams::new(power, 3).unwrap();
            let small = score_frames(volume([1, 1, 5, 5], vec![0.5; 25]), &params).unwrap();
            let large = score_frames(volume([1, 1, 5, 5], vec![1.5; 25]), &params).unwrap();
            assert!(large[0].score >= small[0].score);
        }
    }

    #[test]
    fn scoring_is_deterministic() {
        let values: Vec<f32> = (0..2 * 3 * 6 * 6).map(|v| ((v * 37) % 11) as f32 - 5.0).collect();
        let params = ScoringParams::new(2, 3).unwrap();
        let first = score_frames(volume([2, 3, 6, 6], values.clone()), &params).unwrap();
        let second = score_frames(volume([2, 3, 6, 6], values), &params).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(matches!(ScoringParams::new(3, 5), Err(PipelineError::InvalidScoring(_))));
        assert!(matches!(ScoringParams::new(1, 4), Err(PipelineError::InvalidScoring(_))));
        assert!(matches!(ScoringParams::new(1, 0), Err(PipelineError::InvalidScoring(_))));

        let oversized = ScoringParams::new(1, 9).unwrap();
        let result = score_frames(volume([1, 1, 7, 7], vec![0.0; 49]), &oversized);
        assert!(matches!(result, Err(PipelineError::InvalidScoring(_))));
    }

    #[test]
    fn params_deserialize_from_power_numbers() {
        let params: ScoringParams =
            serde_json::from_str(r#"{"power": 2, "patch_size": 3}"#).unwrap();
        assert_eq!(params.power, ChannelCombine::Squared);
        assert!(serde_json::from_str::<ScoringParams>(r#"{"power": 4}"#).is_err());
        assert_eq!(serde_json::from_str::<ScoringParams>("{}").unwrap(), ScoringParams::default());
    }
}
