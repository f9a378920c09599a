//! Standalone activation layers.
//!
//! Convolutions fuse their own [`Activation`](super::Activation); this module
//! holds activations applied as separate graph nodes.

use super::layer::{single_input, BuildContext, ImageDims, Layer};
use crate::autograd::Tensor;
use crate::config::DataFormat;
use crate::error::{FcnError, Result};

/// Softmax over the channel axis of an image tensor.
///
/// Turns per-pixel class scores into per-pixel class probabilities.
///
/// # Shape
///
/// - Input: `(N, H, W, C)` or `(N, C, H, W)`
/// - Output: same as input, summing to 1 over `C`
#[derive(Debug, Clone, Copy, Default)]
pub struct Softmax {
    axis: Option<usize>,
}

impl Softmax {
    /// Channel softmax.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for Softmax {
    fn kind(&self) -> &'static str {
        "activation"
    }

    fn build(&mut self, input_shapes: &[&[usize]], ctx: &mut BuildContext) -> Result<Vec<usize>> {
        let shape = single_input(input_shapes, self.kind())?;
        ImageDims::from_shape(shape, ctx.format())?;
        self.axis = Some(match ctx.format() {
            DataFormat::ChannelsLast => 3,
            DataFormat::ChannelsFirst => 1,
        });
        Ok(shape.to_vec())
    }

    fn forward(&self, inputs: &[&Tensor], _training: bool) -> Result<Tensor> {
        let axis = self
            .axis
            .ok_or_else(|| FcnError::InvalidArchitecture("softmax used before build".into()))?;
        let x = inputs[0];
        if x.ndim() != 4 {
            return Err(FcnError::shape(self.kind(), "4-D batch", x.shape()));
        }
        Ok(x.softmax_axis(axis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::layer::Indexer;

    #[test]
    fn test_probabilities_sum_to_one_per_pixel() {
        for (format, shape) in [
            (DataFormat::ChannelsLast, [2, 3, 4]),
            (DataFormat::ChannelsFirst, [4, 2, 3]),
        ] {
            let mut softmax = Softmax::new();
            let mut ctx = BuildContext::new(format, None);
            softmax.build(&[&shape], &mut ctx).expect("build");

            let data: Vec<f32> = (0..24).map(|i| (i as f32 * 0.37).sin()).collect();
            let mut batch = vec![1];
            batch.extend(shape);
            let y = softmax.forward(&[&Tensor::from_vec(data, &batch)], false).expect("forward");

            let dims = ImageDims::from_shape(&shape, format).expect("dims");
            let ix = Indexer::new(dims, format);
            for py in 0..2 {
                for px in 0..3 {
                    let total: f32 = (0..4).map(|c| y.data()[ix.at(0, py, px, c)]).sum();
                    assert!((total - 1.0).abs() < 1e-5);
                }
            }
        }
    }
}
