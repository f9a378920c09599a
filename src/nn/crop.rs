//! Spatial cropping and zero padding.
//!
//! Both layers move pixels without arithmetic, so they share one
//! index-gather kernel whose gradient scatters back to the source.

use std::sync::Arc;

use super::layer::{check_batch, single_input, BuildContext, ImageDims, Indexer, Layer};
use crate::autograd::{record, GradFn, Tensor};
use crate::error::{FcnError, Result};

/// Where a crop window starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CropOffset {
    /// `((H - h) / 2, (W - w) / 2)`, rounding down.
    #[default]
    Centered,
    /// Explicit `(row, column)` of the top-left corner.
    Explicit(usize, usize),
}

impl From<usize> for CropOffset {
    fn from(offset: usize) -> Self {
        Self::Explicit(offset, offset)
    }
}

impl From<(usize, usize)> for CropOffset {
    fn from((row, col): (usize, usize)) -> Self {
        Self::Explicit(row, col)
    }
}

/// Crops its input to the spatial size of another tensor.
///
/// Aligns a skip connection with a decoded feature map whose size drifted
/// through padding and striding.
#[derive(Debug, Clone)]
pub struct CroppingLike2D {
    target: (usize, usize),
    offset: CropOffset,
    geometry: Option<GatherGeometry>,
}

impl CroppingLike2D {
    /// Crop to `target` `(height, width)`.
    #[must_use]
    pub fn new(target: (usize, usize), offset: CropOffset) -> Self {
        Self {
            target,
            offset,
            geometry: None,
        }
    }

    /// Target `(height, width)`.
    #[must_use]
    pub fn target(&self) -> (usize, usize) {
        self.target
    }
}

impl Layer for CroppingLike2D {
    fn kind(&self) -> &'static str {
        "cropping_like2d"
    }

    fn build(&mut self, input_shapes: &[&[usize]], ctx: &mut BuildContext) -> Result<Vec<usize>> {
        let shape = single_input(input_shapes, self.kind())?;
        let format = ctx.format();
        let dims = ImageDims::from_shape(shape, format)?;
        let (th, tw) = self.target;
        let (top, left) = match self.offset {
            CropOffset::Centered => (
                dims.height.saturating_sub(th) / 2,
                dims.width.saturating_sub(tw) / 2,
            ),
            CropOffset::Explicit(top, left) => (top, left),
        };
        if top + th > dims.height {
            return Err(FcnError::shape(
                "crop height",
                format!("at most {}", dims.height),
                top + th,
            ));
        }
        if left + tw > dims.width {
            return Err(FcnError::shape(
                "crop width",
                format!("at most {}", dims.width),
                left + tw,
            ));
        }

        let out = ImageDims {
            height: th,
            width: tw,
            channels: dims.channels,
        };
        self.geometry = Some(GatherGeometry {
            input: Indexer::new(dims, format),
            output: Indexer::new(out, format),
            rows: Shift::Crop(top),
            cols: Shift::Crop(left),
        });
        Ok(out.to_shape(format))
    }

    fn forward(&self, inputs: &[&Tensor], _training: bool) -> Result<Tensor> {
        let g = self
            .geometry
            .ok_or_else(|| FcnError::InvalidArchitecture("cropping_like2d used before build".into()))?;
        gather(&g, inputs[0], self.kind())
    }
}

/// Pads height and width with zeros on every side.
#[derive(Debug, Clone)]
pub struct ZeroPadding2D {
    padding: usize,
    geometry: Option<GatherGeometry>,
}

impl ZeroPadding2D {
    /// `padding` zero rows and columns on each border.
    #[must_use]
    pub fn new(padding: usize) -> Self {
        Self {
            padding,
            geometry: None,
        }
    }
}

impl Layer for ZeroPadding2D {
    fn kind(&self) -> &'static str {
        "zero_padding2d"
    }

    fn build(&mut self, input_shapes: &[&[usize]], ctx: &mut BuildContext) -> Result<Vec<usize>> {
        let shape = single_input(input_shapes, self.kind())?;
        let format = ctx.format();
        let dims = ImageDims::from_shape(shape, format)?;
        let out = ImageDims {
            height: dims.height + 2 * self.padding,
            width: dims.width + 2 * self.padding,
            channels: dims.channels,
        };
        self.geometry = Some(GatherGeometry {
            input: Indexer::new(dims, format),
            output: Indexer::new(out, format),
            rows: Shift::Pad(self.padding),
            cols: Shift::Pad(self.padding),
        });
        Ok(out.to_shape(format))
    }

    fn forward(&self, inputs: &[&Tensor], _training: bool) -> Result<Tensor> {
        let g = self
            .geometry
            .ok_or_else(|| FcnError::InvalidArchitecture("zero_padding2d used before build".into()))?;
        gather(&g, inputs[0], self.kind())
    }
}

#[derive(Debug, Clone, Copy)]
enum Shift {
    Crop(usize),
    Pad(usize),
}

impl Shift {
    fn source(self, o: usize, len: usize) -> Option<usize> {
        match self {
            Self::Crop(offset) => Some(o + offset),
            Self::Pad(pad) => o.checked_sub(pad).filter(|&i| i < len),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GatherGeometry {
    input: Indexer,
    output: Indexer,
    rows: Shift,
    cols: Shift,
}

fn gather(g: &GatherGeometry, x: &Tensor, kind: &str) -> Result<Tensor> {
    let batch = check_batch(x, &g.input.dims.to_shape(g.input.format), kind)?;
    let xd = x.data();
    let ImageDims {
        height,
        width,
        channels,
    } = g.output.dims;

    let mut data = vec![0.0; batch * height * width * channels];
    let mut sources = vec![None; data.len()];
    for b in 0..batch {
        for oy in 0..height {
            let Some(iy) = g.rows.source(oy, g.input.dims.height) else { continue };
            for ox in 0..width {
                let Some(ix) = g.cols.source(ox, g.input.dims.width) else { continue };
                for c in 0..channels {
                    let o = g.output.at(b, oy, ox, c);
                    let at = g.input.at(b, iy, ix, c);
                    data[o] = xd[at];
                    sources[o] = Some(at);
                }
            }
        }
    }

    let mut out = Tensor::from_vec(data, &g.output.batch_shape(batch));
    let input_shape = x.shape().to_vec();
    record(&mut out, &[x], |_| {
        Arc::new(GatherBackward {
            sources,
            input_shape,
        })
    });
    Ok(out)
}

struct GatherBackward {
    sources: Vec<Option<usize>>,
    input_shape: Vec<usize>,
}

impl GradFn for GatherBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let mut grad = Tensor::zeros(&self.input_shape);
        let gx = grad.data_mut();
        for (source, &g) in self.sources.iter().zip(grad_output.data()) {
            if let Some(at) = source {
                gx[*at] += g;
            }
        }
        vec![grad]
    }

    fn name(&self) -> &'static str {
        "GatherBackward"
    }
}
