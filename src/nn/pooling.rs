//! Max pooling.

use std::sync::Arc;

use super::conv::{Padding, Window};
use super::layer::{check_batch, single_input, BuildContext, ImageDims, Indexer, Layer};
use crate::autograd::{record, GradFn, Tensor};
use crate::error::{FcnError, Result};

/// 2-D max pooling.
///
/// With `same` padding each spatial dimension becomes `ceil(n / stride)`;
/// padded positions never win the max.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    pool_size: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
    geometry: Option<PoolGeometry>,
}

#[derive(Debug, Clone, Copy)]
struct PoolGeometry {
    rows: Window,
    cols: Window,
    input: Indexer,
    output: Indexer,
}

impl MaxPool2d {
    /// Pooling with window `pool_size`, stride `strides`.
    #[must_use]
    pub fn new(pool_size: (usize, usize), strides: (usize, usize)) -> Self {
        Self {
            pool_size,
            strides,
            padding: Padding::Valid,
            geometry: None,
        }
    }

    /// Sets the padding mode.
    #[must_use]
    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }
}

impl Layer for MaxPool2d {
    fn kind(&self) -> &'static str {
        "max_pooling2d"
    }

    fn build(&mut self, input_shapes: &[&[usize]], ctx: &mut BuildContext) -> Result<Vec<usize>> {
        let shape = single_input(input_shapes, self.kind())?;
        let format = ctx.format();
        let dims = ImageDims::from_shape(shape, format)?;
        let rows = Window::new(dims.height, self.pool_size.0, self.strides.0, 1, self.padding)?;
        let cols = Window::new(dims.width, self.pool_size.1, self.strides.1, 1, self.padding)?;
        let out = ImageDims {
            height: rows.output,
            width: cols.output,
            channels: dims.channels,
        };
        self.geometry = Some(PoolGeometry {
            rows,
            cols,
            input: Indexer::new(dims, format),
            output: Indexer::new(out, format),
        });
        Ok(out.to_shape(format))
    }

    fn forward(&self, inputs: &[&Tensor], _training: bool) -> Result<Tensor> {
        let g = self
            .geometry
            .ok_or_else(|| FcnError::InvalidArchitecture("max_pooling2d used before build".into()))?;
        let x = inputs[0];
        let batch = check_batch(x, &g.input.dims.to_shape(g.input.format), self.kind())?;
        let xd = x.data();
        let channels = g.input.dims.channels;

        let len = batch * g.output.dims.height * g.output.dims.width * channels;
        let mut data = vec![0.0; len];
        let mut argmax = vec![0usize; len];

        for b in 0..batch {
            for oy in 0..g.rows.output {
                for ox in 0..g.cols.output {
                    for c in 0..channels {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_at = None;
                        for ky in 0..g.rows.kernel {
                            let Some(iy) = g.rows.source(oy, ky) else { continue };
                            for kx in 0..g.cols.kernel {
                                let Some(ix) = g.cols.source(ox, kx) else { continue };
                                let at = g.input.at(b, iy, ix, c);
                                if best_at.is_none() || xd[at] > best {
                                    best = xd[at];
                                    best_at = Some(at);
                                }
                            }
                        }
                        let o = g.output.at(b, oy, ox, c);
                        // Every window overlaps the input at least once
                        let at = best_at.unwrap_or_default();
                        data[o] = xd[at];
                        argmax[o] = at;
                    }
                }
            }
        }

        let mut out = Tensor::from_vec(data, &g.output.batch_shape(batch));
        let input_shape = x.shape().to_vec();
        record(&mut out, &[x], |_| {
            Arc::new(MaxPoolBackward {
                argmax,
                input_shape,
            })
        });
        Ok(out)
    }
}

struct MaxPoolBackward {
    argmax: Vec<usize>,
    input_shape: Vec<usize>,
}

impl GradFn for MaxPoolBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let mut grad = Tensor::zeros(&self.input_shape);
        let gx = grad.data_mut();
        for (&at, &g) in self.argmax.iter().zip(grad_output.data()) {
            gx[at] += g;
        }
        vec![grad]
    }

    fn name(&self) -> &'static str {
        "MaxPoolBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{clear_graph, get_grad};
    use crate::config::DataFormat;
    use proptest::prelude::*;

    fn build(shape: &[usize], padding: Padding) -> (MaxPool2d, Vec<usize>) {
        let mut pool = MaxPool2d::new((2, 2), (2, 2)).padding(padding);
        let mut ctx = BuildContext::new(DataFormat::ChannelsLast, None);
        let out = pool.build(&[shape], &mut ctx).expect("build");
        (pool, out)
    }

    #[test]
    fn test_vgg_pool_chain_halves_with_ceil() {
        let mut side = 500;
        let mut seen = Vec::new();
        for _ in 0..5 {
            let (_, out) = build(&[side, side, 1], Padding::Same);
            side = out[0];
            seen.push(side);
        }
        assert_eq!(seen, vec![250, 125, 63, 32, 16]);
    }

    #[test]
    fn test_same_padding_odd_edge() {
        let (pool, out) = build(&[3, 3, 1], Padding::Same);
        assert_eq!(out, vec![2, 2, 1]);
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, -9.0], &[1, 3, 3, 1]);
        let y = pool.forward(&[&x], false).expect("forward");
        // Padding never wins, even against negative values
        assert_eq!(y.data(), &[5.0, 6.0, 8.0, -9.0]);
    }

    #[test]
    fn test_gradient_routes_to_argmax() {
        clear_graph();
        let (pool, _) = build(&[2, 2, 1], Padding::Valid);
        let x = Tensor::new(&[1.0, 4.0, 3.0, 2.0], &[1, 2, 2, 1]).requires_grad();
        pool.forward(&[&x], true).expect("forward").sum().backward();
        assert_eq!(get_grad(x.id()).expect("grad").data(), &[0.0, 1.0, 0.0, 0.0]);
    }

    proptest! {
        #[test]
        fn prop_same_pool_is_ceil_half(h in 1usize..300, w in 1usize..300) {
            let (_, out) = build(&[h, w, 2], Padding::Same);
            prop_assert_eq!(out, vec![h.div_ceil(2), w.div_ceil(2), 2]);
        }
    }
}
