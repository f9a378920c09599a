//! Bilinear resizing to an explicit spatial size.

use std::sync::Arc;

use super::layer::{check_batch, single_input, BuildContext, ImageDims, Indexer, Layer};
use crate::autograd::{record, GradFn, Tensor};
use crate::error::{FcnError, Result};

/// Interpolation taps of one output coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Taps {
    lo: usize,
    hi: usize,
    frac: f32,
}

/// Source coordinate `dst * in / out`, without corner alignment.
fn taps(input: usize, output: usize) -> Vec<Taps> {
    let scale = input as f32 / output as f32;
    (0..output)
        .map(|o| {
            let src = o as f32 * scale;
            let lo = (src.floor() as usize).min(input - 1);
            Taps {
                lo,
                hi: (lo + 1).min(input - 1),
                frac: src - lo as f32,
            }
        })
        .collect()
}

/// Resizes feature maps to a fixed `(height, width)` with bilinear
/// interpolation.
///
/// Unlike a transposed convolution, the output size is exact, so the
/// decoder can land on the spatial size of the next skip connection.
#[derive(Debug, Clone)]
pub struct BilinearUpSampling2D {
    target: (usize, usize),
    geometry: Option<ResizeGeometry>,
}

#[derive(Debug, Clone)]
struct ResizeGeometry {
    input: Indexer,
    output: Indexer,
    rows: Vec<Taps>,
    cols: Vec<Taps>,
}

impl BilinearUpSampling2D {
    /// Resize to `target` `(height, width)`.
    #[must_use]
    pub fn new(target: (usize, usize)) -> Self {
        Self {
            target,
            geometry: None,
        }
    }
}

impl Layer for BilinearUpSampling2D {
    fn kind(&self) -> &'static str {
        "bilinear_up_sampling2d"
    }

    fn build(&mut self, input_shapes: &[&[usize]], ctx: &mut BuildContext) -> Result<Vec<usize>> {
        let shape = single_input(input_shapes, self.kind())?;
        let format = ctx.format();
        let dims = ImageDims::from_shape(shape, format)?;
        let (th, tw) = self.target;
        if th == 0 || tw == 0 || dims.height == 0 || dims.width == 0 {
            return Err(FcnError::shape(self.kind(), "non-empty spatial size", (th, tw)));
        }
        let out = ImageDims {
            height: th,
            width: tw,
            channels: dims.channels,
        };
        self.geometry = Some(ResizeGeometry {
            input: Indexer::new(dims, format),
            output: Indexer::new(out, format),
            rows: taps(dims.height, th),
            cols: taps(dims.width, tw),
        });
        Ok(out.to_shape(format))
    }

    fn forward(&self, inputs: &[&Tensor], _training: bool) -> Result<Tensor> {
        let g = self
            .geometry
            .as_ref()
            .ok_or_else(|| FcnError::InvalidArchitecture("bilinear_up_sampling2d used before build".into()))?;
        let x = inputs[0];
        let batch = check_batch(x, &g.input.dims.to_shape(g.input.format), self.kind())?;
        let xd = x.data();
        let channels = g.input.dims.channels;

        let mut data = vec![0.0; batch * g.rows.len() * g.cols.len() * channels];
        for_each_tap(g, batch, |o, at, weight| data[o] += weight * xd[at]);

        let mut out = Tensor::from_vec(data, &g.output.batch_shape(batch));
        record(&mut out, &[x], |_| {
            Arc::new(ResizeBackward {
                geometry: g.clone(),
                batch,
            })
        });
        Ok(out)
    }
}

/// Visits `(output index, input index, weight)` for every interpolation tap.
fn for_each_tap(g: &ResizeGeometry, batch: usize, mut visit: impl FnMut(usize, usize, f32)) {
    let channels = g.input.dims.channels;
    for b in 0..batch {
        for (oy, r) in g.rows.iter().enumerate() {
            for (ox, col) in g.cols.iter().enumerate() {
                let corners = [
                    (r.lo, col.lo, (1.0 - r.frac) * (1.0 - col.frac)),
                    (r.lo, col.hi, (1.0 - r.frac) * col.frac),
                    (r.hi, col.lo, r.frac * (1.0 - col.frac)),
                    (r.hi, col.hi, r.frac * col.frac),
                ];
                for c in 0..channels {
                    let o = g.output.at(b, oy, ox, c);
                    for &(iy, ix, weight) in &corners {
                        if weight != 0.0 {
                            visit(o, g.input.at(b, iy, ix, c), weight);
                        }
                    }
                }
            }
        }
    }
}

struct ResizeBackward {
    geometry: ResizeGeometry,
    batch: usize,
}

impl GradFn for ResizeBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let mut grad = Tensor::zeros(&self.geometry.input.batch_shape(self.batch));
        let gx = grad.data_mut();
        let go = grad_output.data();
        for_each_tap(&self.geometry, self.batch, |o, at, weight| gx[at] += weight * go[o]);
        vec![grad]
    }

    fn name(&self) -> &'static str {
        "ResizeBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{clear_graph, get_grad};
    use crate::config::DataFormat;

    fn built(shape: &[usize], target: (usize, usize)) -> BilinearUpSampling2D {
        let mut up = BilinearUpSampling2D::new(target);
        let mut ctx = BuildContext::new(DataFormat::ChannelsLast, None);
        up.build(&[shape], &mut ctx).expect("build");
        up
    }

    #[test]
    fn test_taps_follow_half_open_mapping() {
        let t = taps(2, 4);
        assert_eq!(t[0], Taps { lo: 0, hi: 1, frac: 0.0 });
        assert_eq!(t[1], Taps { lo: 0, hi: 1, frac: 0.5 });
        assert_eq!(t[2], Taps { lo: 1, hi: 1, frac: 0.0 });
        assert_eq!(t[3], Taps { lo: 1, hi: 1, frac: 0.5 });
    }

    #[test]
    fn test_upsample_row() {
        let up = built(&[1, 2, 1], (1, 4));
        let x = Tensor::new(&[0.0, 4.0], &[1, 1, 2, 1]);
        let y = up.forward(&[&x], false).expect("forward");
        assert_eq!(y.shape(), &[1, 1, 4, 1]);
        assert_eq!(y.data(), &[0.0, 2.0, 4.0, 4.0]);
    }

    #[test]
    fn test_constant_map_stays_constant_at_odd_size() {
        let up = built(&[16, 16, 3], (63, 500));
        let x = Tensor::from_vec(vec![0.25; 16 * 16 * 3], &[1, 16, 16, 3]);
        let y = up.forward(&[&x], false).expect("forward");
        assert_eq!(y.shape(), &[1, 63, 500, 3]);
        assert!(y.data().iter().all(|v| (v - 0.25).abs() < 1e-5));
    }

    #[test]
    fn test_gradient_preserves_mass() {
        clear_graph();
        let up = built(&[3, 3, 2], (7, 5));
        let x = Tensor::ones(&[1, 3, 3, 2]).requires_grad();
        up.forward(&[&x], true).expect("forward").sum().backward();
        let total: f32 = get_grad(x.id()).expect("grad").data().iter().sum();
        // Every output distributes a total weight of one
        assert!((total - 7.0 * 5.0 * 2.0).abs() < 1e-3);
    }
}
