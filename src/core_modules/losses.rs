// THEORY:
// Every clip trains the generator against four targets at once.
//
// 1.  **Context**: the generator's internal context embedding must match the fixed
//     context model's embedding of the same frames (MSE), without the last frame.
// 2.  **Reconstruction**: the reconstruction must match its own input frames
//     (the clip without its last frame), both in value (MSE) and in structure (L1
//     between absolute horizontal and vertical intensity gradients).
// 3.  **Instant**: the short-term prediction must match the clip shifted by one
//     frame (frames `1..end`), with the same value + structure terms.
// 4.  **Longterm**: the long-term prediction is held to the same shifted target.
//
// The total is a weighted sum. The weights are a first-class configuration value,
// all 1 by default.

use crate::core_modules::models::GeneratorOutput;
use crate::error::{PipelineError, Result};
use burn::tensor::{ElementConversion, Tensor, backend::Backend};
use serde::{Deserialize, Serialize};

fn unit_weight() -> f32 {
    1.0
}

/// Weights of the four loss terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LossWeights {
    #[serde(default = "unit_weight")]
    pub context: f32,
    #[serde(default = "unit_weight")]
    pub recons: f32,
    #[serde(default = "unit_weight")]
    pub instant: f32,
    #[serde(default = "unit_weight")]
    pub longterm: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            context: 1.0,
            recons: 1.0,
            instant: 1.0,
            longterm: 1.0,
        }
    }
}

impl LossWeights {
    pub fn validate(&self) -> Result<()> {
        for (name, weight) in self.named() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(PipelineError::Config(format!(
                    "loss weight '{}' must be finite and non-negative, got {}",
                    name, weight
                )));
            }
        }
        Ok(())
    }

    fn named(&self) -> [(&'static str, f32); 4] {
        [
            ("context", self.context),
            ("recons", self.recons),
            ("instant", self.instant),
            ("longterm", self.longterm),
        ]
    }
}

/// Absolute horizontal and vertical intensity gradients of a
/// `[batch, time, channel, height, width]` tensor.
///
/// `dx` has one column less than the input, `dy` one row less.
pub fn image_gradient<B: Backend>(frames: Tensor<B, 5>) -> (Tensor<B, 5>, Tensor<B, 5>) {
    let [b, t, c, h, w] = frames.dims();
    let dx = frames.clone().slice([0..b, 0..t, 0..c, 0..h, 1..w])
        - frames.clone().slice([0..b, 0..t, 0..c, 0..h, 0..w - 1]);
    let dy = frames.clone().slice([0..b, 0..t, 0..c, 1..h, 0..w])
        - frames.slice([0..b, 0..t, 0..c, 0..h - 1, 0..w]);
    (dx.abs(), dy.abs())
}

pub fn mse<B: Backend, const D: usize>(output: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    (output - target).powf_scalar(2.0).mean()
}

pub fn l1<B: Backend, const D: usize>(output: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    (output - target).abs().mean()
}

/// MSE plus the L1 distance between the absolute image gradients of both sides.
pub fn frame_loss<B: Backend>(output: Tensor<B, 5>, target: Tensor<B, 5>) -> Tensor<B, 1> {
    let (dx_output, dy_output) = image_gradient(output.clone());
    let (dx_target, dy_target) = image_gradient(target.clone());
    mse(output, target) + l1(dx_output, dx_target) + l1(dy_output, dy_target)
}

/// The four loss terms of one clip.
#[derive(Debug, Clone)]
pub struct LossBundle<B: Backend> {
    pub context: Tensor<B, 1>,
    pub reconstruction: Tensor<B, 1>,
    pub instant: Tensor<B, 1>,
    pub longterm: Tensor<B, 1>,
}

/// Host copies of a loss bundle, for logging and checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossValues {
    pub context: f32,
    pub reconstruction: f32,
    pub instant: f32,
    pub longterm: f32,
}

impl LossValues {
    /// `(tag, value)` pairs in the order they are logged.
    pub fn tagged(&self) -> [(&'static str, f32); 4] {
        [
            ("Loss context", self.context),
            ("Loss reconst", self.reconstruction),
            ("Loss instant", self.instant),
            ("Loss longterm", self.longterm),
        ]
    }

    /// The name of the first non-finite term, if any.
    pub fn first_non_finite(&self) -> Option<&'static str> {
        [
            ("context", self.context),
            ("reconstruction", self.reconstruction),
            ("instant", self.instant),
            ("longterm", self.longterm),
        ]
        .into_iter()
        .find(|(_, value)| !value.is_finite())
        .map(|(name, _)| name)
    }
}

impl<B: Backend> LossBundle<B> {
    /// Computes the four terms for one clip.
    ///
    /// `clip` is the full `[1, time, channel, height, width]` clip; the generator
    /// saw `clip[:, ..time - 1]`. `context_target` is the fixed model's embedding of
    /// the full clip, `[1, time, features]`.
    pub fn compute(
        output: &GeneratorOutput<B>,
        clip: Tensor<B, 5>,
        context_target: Tensor<B, 3>,
    ) -> Self {
        let [b, t, c, h, w] = clip.dims();
        let [cb, ct, cd] = context_target.dims();
        let inputs = clip.clone().slice([0..b, 0..t - 1, 0..c, 0..h, 0..w]);
        let targets = clip.slice([0..b, 1..t, 0..c, 0..h, 0..w]);

        Self {
            context: mse(
                output.context.clone(),
                context_target.slice([0..cb, 0..ct - 1, 0..cd]),
            ),
            reconstruction: frame_loss(output.reconstruction.clone(), inputs),
            instant: frame_loss(output.instant.clone(), targets.clone()),
            longterm: frame_loss(output.longterm.clone(), targets),
        }
    }

    pub fn total(&self, weights: &LossWeights) -> Tensor<B, 1> {
        self.context.clone().mul_scalar(weights.context)
            + self.reconstruction.clone().mul_scalar(weights.recons)
            + self.instant.clone().mul_scalar(weights.instant)
            + self.longterm.clone().mul_scalar(weights.longterm)
    }

    pub fn values(&self) -> LossValues {
        LossValues {
            context: scalar(&self.context),
            reconstruction: scalar(&self.reconstruction),
            instant: scalar(&self.instant),
            longterm: scalar(&self.longterm),
        }
    }
}

fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f32 {
    tensor.clone().into_scalar().elem::<f32>()
}
