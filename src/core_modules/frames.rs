// THEORY:
// A `FrameVolume` is the host-side representation of an ordered run of frames:
// a dense `[time, channel, height, width]` block of `f32` values. Videos, clip
// predictions and the persisted prediction store are all frame volumes. Keeping
// them on the host (instead of as backend tensors) makes them serializable and
// backend-independent; they are lifted into tensors only for the one operation
// that needs them, and lowered back right after.

use crate::error::{PipelineError, Result};
use burn::tensor::{Tensor, TensorData, backend::Backend};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A dense `[time, channel, height, width]` block of frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameVolume {
    shape: [usize; 4],
    values: Vec<f32>,
}

impl FrameVolume {
    pub fn new(shape: [usize; 4], values: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(PipelineError::InvalidVolume(format!(
                "shape {:?} needs {} values, got {}",
                shape,
                expected,
                values.len()
            )));
        }
        Ok(Self { shape, values })
    }

    pub fn zeros(shape: [usize; 4]) -> Self {
        Self {
            shape,
            values: vec![0.0; shape.iter().product()],
        }
    }

    /// Builds a volume from a sequence of frames, each `[channel, height, width]`.
    pub fn from_frames(frame_shape: [usize; 3], frames: Vec<Vec<f32>>) -> Result<Self> {
        let frame_len: usize = frame_shape.iter().product();
        let mut values = Vec::with_capacity(frame_len * frames.len());
        for (index, frame) in frames.iter().enumerate() {
            if frame.len() != frame_len {
                return Err(PipelineError::InvalidVolume(format!(
                    "frame {} has {} values, expected {}",
                    index,
                    frame.len(),
                    frame_len
                )));
            }
            values.extend_from_slice(frame);
        }
        let [c, h, w] = frame_shape;
        Self::new([frames.len(), c, h, w], values)
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn num_frames(&self) -> usize {
        self.shape[0]
    }

    /// The `[channel, height, width]` shape of a single frame.
    pub fn frame_shape(&self) -> [usize; 3] {
        [self.shape[1], self.shape[2], self.shape[3]]
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    fn frame_len(&self) -> usize {
        self.shape[1] * self.shape[2] * self.shape[3]
    }

    /// The values of frame `index`, channel-major.
    pub fn frame(&self, index: usize) -> Option<&[f32]> {
        if index >= self.num_frames() {
            return None;
        }
        let len = self.frame_len();
        Some(&self.values[index * len..(index + 1) * len])
    }

    /// Copies the half-open frame range `range` into a new volume.
    pub fn frames(&self, range: Range<usize>) -> Result<Self> {
        if range.start > range.end || range.end > self.num_frames() {
            return Err(PipelineError::InvalidVolume(format!(
                "frame range {:?} outside a volume of {} frames",
                range,
                self.num_frames()
            )));
        }
        let len = self.frame_len();
        let [_, c, h, w] = self.shape;
        Ok(Self {
            shape: [range.end - range.start, c, h, w],
            values: self.values[range.start * len..range.end * len].to_vec(),
        })
    }

    /// Concatenates volumes along the time axis, in the given order.
    pub fn concat(parts: Vec<FrameVolume>) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Err(PipelineError::InvalidVolume(
                "cannot concatenate an empty list of volumes".to_string(),
            ));
        };
        let frame_shape = first.frame_shape();
        let mut total = 0;
        for part in &parts {
            if part.frame_shape() != frame_shape {
                return Err(PipelineError::ShapeMismatch {
                    context: "frame concatenation".to_string(),
                    expected: format!("{:?}", frame_shape),
                    found: format!("{:?}", part.frame_shape()),
                });
            }
            total += part.num_frames();
        }
        let mut values = Vec::with_capacity(total * first.frame_len());
        for part in parts {
            values.extend(part.values);
        }
        let [c, h, w] = frame_shape;
        Ok(Self {
            shape: [total, c, h, w],
            values,
        })
    }

    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::from_data(TensorData::new(self.values.clone(), self.shape), device)
    }

    pub fn from_tensor<B: Backend>(tensor: Tensor<B, 4>) -> Result<Self> {
        let shape = tensor.dims();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| PipelineError::Tensor(format!("{:?}", err)))?;
        Self::new(shape, values)
    }
}
