// THEORY:
// The engine works with a pair of models and never looks inside either of them.
//
// 1.  **Context Model (fixed)**: embeds each frame of a clip into a context vector.
//     It is read-only shared state: the trait only offers `&self` operations, and
//     the trainer detaches its output so no gradient ever reaches it.
// 2.  **Generator (trainable)**: sees a clip without its last frame and returns a
//     reconstruction of those frames, a short-term and a long-term prediction of
//     the following frames, its own context embedding and two internal states.
//     It is a burn `Module`, which provides parameter introspection
//     (`num_params`), checkpoint records, and the training/inference switch:
//     the autodiff module trains, `AutodiffModule::valid()` infers.
//
// The two reference models below are small and make the engine runnable end to
// end. Real architectures plug in through the same traits.

use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::tensor::{Tensor, backend::Backend};

/// Everything the generator returns for one clip.
///
/// Frame outputs are `[batch, time, channel, height, width]` with `time` equal to
/// the number of input frames; embeddings and states are `[batch, time, features]`.
#[derive(Debug, Clone)]
pub struct GeneratorOutput<B: Backend> {
    pub state_a: Tensor<B, 3>,
    pub state_b: Tensor<B, 3>,
    pub context: Tensor<B, 3>,
    pub reconstruction: Tensor<B, 5>,
    pub instant: Tensor<B, 5>,
    pub longterm: Tensor<B, 5>,
}

/// The trainable prediction network.
pub trait FrameGenerator<B: Backend>: Module<B> {
    /// `frames` is `[batch, time, channel, height, width]`.
    fn forward(&self, frames: Tensor<B, 5>) -> GeneratorOutput<B>;
}

/// The fixed context network.
pub trait ContextModel<B: Backend> {
    /// Embeds `[time, channel, height, width]` frames into `[time, features]`.
    fn embed(&self, frames: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Context embedding made of each frame's per-channel spatial mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanContextNet;

impl MeanContextNet {
    pub fn new() -> Self {
        Self
    }
}

impl<B: Backend> ContextModel<B> for MeanContextNet {
    fn embed(&self, frames: Tensor<B, 4>) -> Tensor<B, 2> {
        let [t, c, _, _] = frames.dims();
        frames.mean_dim(3).mean_dim(2).reshape([t, c])
    }
}

#[derive(Config, Debug)]
pub struct TinyGeneratorConfig {
    /// Channels per frame.
    pub channels: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
}

impl TinyGeneratorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> TinyGenerator<B> {
        let conv = || {
            Conv2dConfig::new([self.channels, self.channels], [self.kernel_size, self.kernel_size])
                .with_padding(PaddingConfig2d::Same)
                .init::<B>(device)
        };
        TinyGenerator {
            reconstruct: conv(),
            instant: conv(),
            longterm: conv(),
            context_head: LinearConfig::new(self.channels, self.channels).init::<B>(device),
        }
    }
}

/// A per-frame convolutional generator with one head per output branch.
#[derive(Module, Debug)]
pub struct TinyGenerator<B: Backend> {
    reconstruct: Conv2d<B>,
    instant: Conv2d<B>,
    longterm: Conv2d<B>,
    context_head: Linear<B>,
}

impl<B: Backend> TinyGenerator<B> {
    fn per_frame(conv: &Conv2d<B>, frames: Tensor<B, 4>, shape: [usize; 5]) -> Tensor<B, 5> {
        conv.forward(frames).reshape(shape)
    }

    fn spatial_mean(frames: Tensor<B, 5>) -> Tensor<B, 3> {
        let [b, t, c, _, _] = frames.dims();
        frames.mean_dim(4).mean_dim(3).reshape([b, t, c])
    }
}

impl<B: Backend> FrameGenerator<B> for TinyGenerator<B> {
    fn forward(&self, frames: Tensor<B, 5>) -> GeneratorOutput<B> {
        let shape = frames.dims();
        let [b, t, c, h, w] = shape;
        let flat = frames.clone().reshape([b * t, c, h, w]);

        let reconstruction = Self::per_frame(&self.reconstruct, flat.clone(), shape);
        let instant = Self::per_frame(&self.instant, flat.clone(), shape);
        let longterm = Self::per_frame(&self.longterm, flat, shape);
        let context = self.context_head.forward(Self::spatial_mean(frames));

        GeneratorOutput {
            state_a: Self::spatial_mean(instant.clone()),
            state_b: Self::spatial_mean(longterm.clone()),
            context,
            reconstruction,
            instant,
            longterm,
        }
    }
}
