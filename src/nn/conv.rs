//! 2-D convolution and transposed convolution.
//!
//! Kernels use the layouts pretrained archives are stored in:
//! `(kh, kw, in, out)` for [`Conv2d`] and `(kh, kw, out, in)` for
//! [`Conv2dTranspose`]. Activations may be `channels_last` or
//! `channels_first`; the layout is fixed when the layer is built.
//!
//! # References
//!
//! - Long, J., Shelhamer, E., & Darrell, T. (2015). Fully convolutional
//!   networks for semantic segmentation. CVPR.
//! - Dumoulin, V., & Visin, F. (2016). A guide to convolution arithmetic
//!   for deep learning.

use std::sync::Arc;

use super::layer::{
    check_batch, single_input, BuildContext, ImageDims, Indexer, Initializer, Layer, Parameter,
};
use crate::autograd::{record, GradFn, Tensor};
use crate::error::{FcnError, Result};

/// Border handling of a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
    /// Pad so the output covers every input position: `out = ceil(n / stride)`.
    #[default]
    Same,
    /// No padding: only complete windows.
    Valid,
}

/// Activation fused into a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// Identity.
    #[default]
    Linear,
    /// `max(0, x)`.
    Relu,
}

impl Activation {
    pub(crate) fn apply(self, x: Tensor) -> Tensor {
        match self {
            Self::Linear => x,
            Self::Relu => x.relu(),
        }
    }
}

/// Placement of a sliding window along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Window {
    pub kernel: usize,
    pub stride: usize,
    pub dilation: usize,
    pub pad_before: usize,
    pub input: usize,
    pub output: usize,
}

impl Window {
    /// Forward window of a convolution or pooling over `input` positions.
    pub fn new(input: usize, kernel: usize, stride: usize, dilation: usize, padding: Padding) -> Result<Self> {
        if kernel == 0 || stride == 0 || dilation == 0 {
            return Err(FcnError::InvalidArchitecture(
                "kernel size, stride and dilation must be positive".into(),
            ));
        }
        let effective = (kernel - 1) * dilation + 1;
        let (output, pad_before) = match padding {
            Padding::Same => {
                let output = input.div_ceil(stride);
                let total = ((output.saturating_sub(1)) * stride + effective).saturating_sub(input);
                (output, total / 2)
            }
            Padding::Valid => {
                if input < effective {
                    return Err(FcnError::shape(
                        "valid window",
                        format!("at least {effective} positions"),
                        input,
                    ));
                }
                ((input - effective) / stride + 1, 0)
            }
        };
        if output == 0 {
            return Err(FcnError::shape("window", "non-empty input", input));
        }
        Ok(Self {
            kernel,
            stride,
            dilation,
            pad_before,
            input,
            output,
        })
    }

    /// Window of a transposed convolution producing its output from `input` positions.
    pub fn transposed(input: usize, kernel: usize, stride: usize, padding: Padding) -> Result<Self> {
        if kernel == 0 || stride == 0 {
            return Err(FcnError::InvalidArchitecture(
                "kernel size and stride must be positive".into(),
            ));
        }
        let (output, pad_before) = match padding {
            Padding::Valid => (input * stride + kernel.saturating_sub(stride), 0),
            Padding::Same => (input * stride, kernel.saturating_sub(stride) / 2),
        };
        Ok(Self {
            kernel,
            stride,
            dilation: 1,
            pad_before,
            input,
            output,
        })
    }

    /// Input position read by output `o` at tap `k`, if inside the input.
    #[inline]
    pub fn source(&self, o: usize, k: usize) -> Option<usize> {
        (o * self.stride + k * self.dilation)
            .checked_sub(self.pad_before)
            .filter(|&i| i < self.input)
    }

    /// Output position written by input `i` at tap `k` (transposed), if inside the output.
    #[inline]
    pub fn target(&self, i: usize, k: usize) -> Option<usize> {
        (i * self.stride + k)
            .checked_sub(self.pad_before)
            .filter(|&o| o < self.output)
    }
}

#[derive(Debug, Clone, Copy)]
struct ConvGeometry {
    rows: Window,
    cols: Window,
    input: Indexer,
    output: Indexer,
}

/// 2-D convolution layer.
///
/// # Shape
///
/// - Input: `(N, H, W, C_in)` (or `(N, C_in, H, W)`)
/// - Output: `(N, H_out, W_out, filters)` per [`Padding`]
///
/// # Example
///
/// ```
/// use fcn::config::BackendConfig;
/// use fcn::nn::{Activation, Conv2d, Graph, Padding};
///
/// let mut graph = Graph::new(BackendConfig::default());
/// let x = graph.input(&[10, 12, 3])?;
/// let conv = Conv2d::new(64, (3, 3)).activation(Activation::Relu);
/// assert_eq!(graph.apply(conv, &[&x])?.shape(), &[10, 12, 64]);
/// let valid = Conv2d::new(8, (3, 3)).padding(Padding::Valid);
/// assert_eq!(graph.apply(valid, &[&x])?.shape(), &[8, 10, 8]);
/// # Ok::<(), fcn::FcnError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Conv2d {
    filters: usize,
    kernel_size: (usize, usize),
    strides: (usize, usize),
    dilation: (usize, usize),
    padding: Padding,
    activation: Activation,
    use_bias: bool,
    initializer: Initializer,
    l2: f32,
    geometry: Option<ConvGeometry>,
    params: Vec<Parameter>,
}

impl Conv2d {
    /// Convolution with `filters` outputs, unit stride, `same` padding, bias and no activation.
    #[must_use]
    pub fn new(filters: usize, kernel_size: (usize, usize)) -> Self {
        Self {
            filters,
            kernel_size,
            strides: (1, 1),
            dilation: (1, 1),
            padding: Padding::Same,
            activation: Activation::Linear,
            use_bias: true,
            initializer: Initializer::GlorotUniform,
            l2: 0.0,
            geometry: None,
            params: Vec::new(),
        }
    }

    /// Sets the padding mode.
    #[must_use]
    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Sets the strides.
    #[must_use]
    pub fn strides(mut self, strides: (usize, usize)) -> Self {
        self.strides = strides;
        self
    }

    /// Sets the dilation rate.
    #[must_use]
    pub fn dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation = dilation;
        self
    }

    /// Sets the fused activation.
    #[must_use]
    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Sets the kernel initializer.
    #[must_use]
    pub fn kernel_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Adds an L2 penalty `l2 * sum(kernel^2)` to the training loss.
    #[must_use]
    pub fn kernel_l2(mut self, l2: f32) -> Self {
        self.l2 = l2;
        self
    }

    /// Enables or disables the bias.
    #[must_use]
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Number of output channels.
    #[must_use]
    pub fn filters(&self) -> usize {
        self.filters
    }
}

impl Layer for Conv2d {
    fn kind(&self) -> &'static str {
        "conv2d"
    }

    fn build(&mut self, input_shapes: &[&[usize]], ctx: &mut BuildContext) -> Result<Vec<usize>> {
        let shape = single_input(input_shapes, self.kind())?;
        let format = ctx.format();
        let dims = ImageDims::from_shape(shape, format)?;
        let rows = Window::new(dims.height, self.kernel_size.0, self.strides.0, self.dilation.0, self.padding)?;
        let cols = Window::new(dims.width, self.kernel_size.1, self.strides.1, self.dilation.1, self.padding)?;
        let out = ImageDims {
            height: rows.output,
            width: cols.output,
            channels: self.filters,
        };

        self.geometry = Some(ConvGeometry {
            rows,
            cols,
            input: Indexer::new(dims, format),
            output: Indexer::new(out, format),
        });
        let kernel_shape = vec![self.kernel_size.0, self.kernel_size.1, dims.channels, self.filters];
        self.params = vec![Parameter::kernel(kernel_shape, self.initializer, self.l2, ctx.next_seed())];
        if self.use_bias {
            self.params.push(Parameter::bias(self.filters));
        }
        Ok(out.to_shape(format))
    }

    fn forward(&self, inputs: &[&Tensor], _training: bool) -> Result<Tensor> {
        let geometry = self
            .geometry
            .ok_or_else(|| FcnError::InvalidArchitecture("conv2d used before build".into()))?;
        let x = inputs[0];
        let batch = check_batch(x, &geometry.input.dims.to_shape(geometry.input.format), self.kind())?;
        let kernel = self.params[0].tensor()?;
        let bias = match self.params.get(1) {
            Some(p) => Some(p.tensor()?),
            None => None,
        };

        let data = conv_forward(&geometry, batch, x.data(), kernel.data(), bias.map(Tensor::data));
        let mut out = Tensor::from_vec(data, &geometry.output.batch_shape(batch));

        let make = |_: &Tensor| -> Arc<dyn GradFn> {
            Arc::new(Conv2dBackward {
                geometry,
                input: x.detach(),
                kernel: kernel.detach(),
            })
        };
        match bias {
            Some(b) => record(&mut out, &[x, kernel, b], make),
            None => record(&mut out, &[x, kernel], make),
        }
        Ok(self.activation.apply(out))
    }

    fn params(&self) -> &[Parameter] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn is_convolution(&self) -> bool {
        true
    }
}

fn conv_forward(g: &ConvGeometry, batch: usize, x: &[f32], k: &[f32], bias: Option<&[f32]>) -> Vec<f32> {
    let cin = g.input.dims.channels;
    let cout = g.output.dims.channels;
    let kw = g.cols.kernel;
    let mut out = vec![0.0; batch * g.output.dims.height * g.output.dims.width * cout];
    let mut acc = vec![0.0f32; cout];

    for b in 0..batch {
        for oy in 0..g.rows.output {
            for ox in 0..g.cols.output {
                match bias {
                    Some(bias) => acc.copy_from_slice(bias),
                    None => acc.fill(0.0),
                }
                for ky in 0..g.rows.kernel {
                    let Some(iy) = g.rows.source(oy, ky) else { continue };
                    for kx in 0..kw {
                        let Some(ix) = g.cols.source(ox, kx) else { continue };
                        for ci in 0..cin {
                            let xv = x[g.input.at(b, iy, ix, ci)];
                            let row = ((ky * kw + kx) * cin + ci) * cout;
                            for (a, &w) in acc.iter_mut().zip(&k[row..row + cout]) {
                                *a += xv * w;
                            }
                        }
                    }
                }
                for (co, &a) in acc.iter().enumerate() {
                    out[g.output.at(b, oy, ox, co)] = a;
                }
            }
        }
    }
    out
}

struct Conv2dBackward {
    geometry: ConvGeometry,
    input: Tensor,
    kernel: Tensor,
}

impl GradFn for Conv2dBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let g = &self.geometry;
        let batch = grad_output.shape()[0];
        let cin = g.input.dims.channels;
        let cout = g.output.dims.channels;
        let kw = g.cols.kernel;
        let (x, k, go) = (self.input.data(), self.kernel.data(), grad_output.data());

        let mut grad_x = vec![0.0; x.len()];
        let mut grad_k = vec![0.0; k.len()];
        let mut grad_b = vec![0.0; cout];
        let mut gcol = vec![0.0f32; cout];

        for b in 0..batch {
            for oy in 0..g.rows.output {
                for ox in 0..g.cols.output {
                    for (co, gv) in gcol.iter_mut().enumerate() {
                        *gv = go[g.output.at(b, oy, ox, co)];
                    }
                    for (gb, gv) in grad_b.iter_mut().zip(&gcol) {
                        *gb += gv;
                    }
                    for ky in 0..g.rows.kernel {
                        let Some(iy) = g.rows.source(oy, ky) else { continue };
                        for kx in 0..kw {
                            let Some(ix) = g.cols.source(ox, kx) else { continue };
                            for ci in 0..cin {
                                let xi = g.input.at(b, iy, ix, ci);
                                let row = ((ky * kw + kx) * cin + ci) * cout;
                                let mut dx = 0.0;
                                for co in 0..cout {
                                    dx += gcol[co] * k[row + co];
                                    grad_k[row + co] += gcol[co] * x[xi];
                                }
                                grad_x[xi] += dx;
                            }
                        }
                    }
                }
            }
        }

        vec![
            Tensor::from_vec(grad_x, self.input.shape()),
            Tensor::from_vec(grad_k, self.kernel.shape()),
            Tensor::from_vec(grad_b, &[cout]),
        ]
    }

    fn name(&self) -> &'static str {
        "Conv2dBackward"
    }
}

/// Transposed 2-D convolution (learned upsampling).
///
/// With `valid` padding the output size is `n * stride + max(kernel - stride, 0)`,
/// with `same` padding `n * stride`.
#[derive(Debug, Clone)]
pub struct Conv2dTranspose {
    filters: usize,
    kernel_size: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
    use_bias: bool,
    initializer: Initializer,
    l2: f32,
    geometry: Option<ConvGeometry>,
    params: Vec<Parameter>,
}

impl Conv2dTranspose {
    /// Transposed convolution with `filters` outputs, `valid` padding and bias.
    #[must_use]
    pub fn new(filters: usize, kernel_size: (usize, usize), strides: (usize, usize)) -> Self {
        Self {
            filters,
            kernel_size,
            strides,
            padding: Padding::Valid,
            use_bias: true,
            initializer: Initializer::GlorotUniform,
            l2: 0.0,
            geometry: None,
            params: Vec::new(),
        }
    }

    /// Sets the padding mode.
    #[must_use]
    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Enables or disables the bias.
    #[must_use]
    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    /// Sets the kernel initializer.
    #[must_use]
    pub fn kernel_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Adds an L2 penalty on the kernel.
    #[must_use]
    pub fn kernel_l2(mut self, l2: f32) -> Self {
        self.l2 = l2;
        self
    }
}

impl Layer for Conv2dTranspose {
    fn kind(&self) -> &'static str {
        "conv2d_transpose"
    }

    fn build(&mut self, input_shapes: &[&[usize]], ctx: &mut BuildContext) -> Result<Vec<usize>> {
        let shape = single_input(input_shapes, self.kind())?;
        let format = ctx.format();
        let dims = ImageDims::from_shape(shape, format)?;
        let rows = Window::transposed(dims.height, self.kernel_size.0, self.strides.0, self.padding)?;
        let cols = Window::transposed(dims.width, self.kernel_size.1, self.strides.1, self.padding)?;
        let out = ImageDims {
            height: rows.output,
            width: cols.output,
            channels: self.filters,
        };

        self.geometry = Some(ConvGeometry {
            rows,
            cols,
            input: Indexer::new(dims, format),
            output: Indexer::new(out, format),
        });
        let kernel_shape = vec![self.kernel_size.0, self.kernel_size.1, self.filters, dims.channels];
        self.params = vec![Parameter::kernel(kernel_shape, self.initializer, self.l2, ctx.next_seed())];
        if self.use_bias {
            self.params.push(Parameter::bias(self.filters));
        }
        Ok(out.to_shape(format))
    }

    fn forward(&self, inputs: &[&Tensor], _training: bool) -> Result<Tensor> {
        let g = self
            .geometry
            .ok_or_else(|| FcnError::InvalidArchitecture("conv2d_transpose used before build".into()))?;
        let x = inputs[0];
        let batch = check_batch(x, &g.input.dims.to_shape(g.input.format), self.kind())?;
        let kernel = self.params[0].tensor()?;
        let bias = match self.params.get(1) {
            Some(p) => Some(p.tensor()?),
            None => None,
        };

        let cin = g.input.dims.channels;
        let cout = g.output.dims.channels;
        let kw = g.cols.kernel;
        let (xd, k) = (x.data(), kernel.data());
        let mut data = vec![0.0; batch * g.output.dims.height * g.output.dims.width * cout];
        if let Some(bias) = bias {
            for b in 0..batch {
                for oy in 0..g.rows.output {
                    for ox in 0..g.cols.output {
                        for (co, &bv) in bias.data().iter().enumerate() {
                            data[g.output.at(b, oy, ox, co)] = bv;
                        }
                    }
                }
            }
        }

        for b in 0..batch {
            for iy in 0..g.rows.input {
                for ix in 0..g.cols.input {
                    for ky in 0..g.rows.kernel {
                        let Some(oy) = g.rows.target(iy, ky) else { continue };
                        for kx in 0..kw {
                            let Some(ox) = g.cols.target(ix, kx) else { continue };
                            for co in 0..cout {
                                let row = ((ky * kw + kx) * cout + co) * cin;
                                let mut acc = 0.0;
                                for ci in 0..cin {
                                    acc += xd[g.input.at(b, iy, ix, ci)] * k[row + ci];
                                }
                                data[g.output.at(b, oy, ox, co)] += acc;
                            }
                        }
                    }
                }
            }
        }

        let mut out = Tensor::from_vec(data, &g.output.batch_shape(batch));
        let make = |_: &Tensor| -> Arc<dyn GradFn> {
            Arc::new(Conv2dTransposeBackward {
                geometry: g,
                input: x.detach(),
                kernel: kernel.detach(),
            })
        };
        match bias {
            Some(b) => record(&mut out, &[x, kernel, b], make),
            None => record(&mut out, &[x, kernel], make),
        }
        Ok(out)
    }

    fn params(&self) -> &[Parameter] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    fn is_convolution(&self) -> bool {
        true
    }
}

struct Conv2dTransposeBackward {
    geometry: ConvGeometry,
    input: Tensor,
    kernel: Tensor,
}

impl GradFn for Conv2dTransposeBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let g = &self.geometry;
        let batch = grad_output.shape()[0];
        let cin = g.input.dims.channels;
        let cout = g.output.dims.channels;
        let kw = g.cols.kernel;
        let (x, k, go) = (self.input.data(), self.kernel.data(), grad_output.data());

        let mut grad_x = vec![0.0; x.len()];
        let mut grad_k = vec![0.0; k.len()];
        let mut grad_b = vec![0.0; cout];

        for b in 0..batch {
            for oy in 0..g.rows.output {
                for ox in 0..g.cols.output {
                    for (co, gb) in grad_b.iter_mut().enumerate() {
                        *gb += go[g.output.at(b, oy, ox, co)];
                    }
                }
            }
            for iy in 0..g.rows.input {
                for ix in 0..g.cols.input {
                    for ky in 0..g.rows.kernel {
                        let Some(oy) = g.rows.target(iy, ky) else { continue };
                        for kx in 0..kw {
                            let Some(ox) = g.cols.target(ix, kx) else { continue };
                            for co in 0..cout {
                                let gv = go[g.output.at(b, oy, ox, co)];
                                let row = ((ky * kw + kx) * cout + co) * cin;
                                for ci in 0..cin {
                                    let xi = g.input.at(b, iy, ix, ci);
                                    grad_x[xi] += gv * k[row + ci];
                                    grad_k[row + ci] += gv * x[xi];
                                }
                            }
                        }
                    }
                }
            }
        }

        vec![
            Tensor::from_vec(grad_x, self.input.shape()),
            Tensor::from_vec(grad_k, self.kernel.shape()),
            Tensor::from_vec(grad_b, &[cout]),
        ]
    }

    fn name(&self) -> &'static str {
        "Conv2dTransposeBackward"
    }
}

/// Reverses the spatial axes of a `(kh, kw, a, b)` kernel in place.
///
/// Converts kernels between backends that implement convolution as
/// correlation and those that flip the kernel.
pub fn flip_kernel_spatially(kernel: &mut [f32], shape: &[usize]) -> Result<()> {
    let [kh, kw, a, b] = shape else {
        return Err(FcnError::shape("kernel conversion", "4-D kernel", shape));
    };
    let (kh, kw, depth) = (*kh, *kw, a * b);
    let original = kernel.to_vec();
    for ky in 0..kh {
        for kx in 0..kw {
            let src = ((kh - 1 - ky) * kw + (kw - 1 - kx)) * depth;
            let dst = (ky * kw + kx) * depth;
            kernel[dst..dst + depth].copy_from_slice(&original[src..src + depth]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{clear_graph, get_grad};
    use crate::config::DataFormat;

    fn built<L: Layer>(mut layer: L, shape: &[usize]) -> (L, Vec<usize>) {
        let mut ctx = BuildContext::new(DataFormat::ChannelsLast, Some(3));
        let out = layer.build(&[shape], &mut ctx).expect("build");
        (layer, out)
    }

    #[test]
    fn test_same_window_matches_ceil_division() {
        for n in [500, 250, 125, 63, 32, 1366, 768, 1] {
            let w = Window::new(n, 2, 2, 1, Padding::Same).expect("window");
            assert_eq!(w.output, n.div_ceil(2));
        }
        let fc6 = Window::new(16, 7, 1, 2, Padding::Same).expect("window");
        assert_eq!((fc6.output, fc6.pad_before), (16, 6));
    }

    #[test]
    fn test_valid_window_rejects_small_input() {
        assert!(Window::new(3, 7, 1, 1, Padding::Valid).is_err());
        assert_eq!(Window::new(7, 3, 2, 1, Padding::Valid).expect("w").output, 3);
    }

    #[test]
    fn test_conv_output_shape() {
        let (_, out) = built(Conv2d::new(8, (3, 3)), &[10, 12, 3]);
        assert_eq!(out, vec![10, 12, 8]);
        let (_, out) = built(Conv2d::new(8, (3, 3)).padding(Padding::Valid), &[10, 12, 3]);
        assert_eq!(out, vec![8, 10, 8]);
    }

    #[test]
    fn test_conv_forward_identity_kernel() {
        let (mut conv, _) = built(Conv2d::new(1, (3, 3)), &[3, 3, 1]);
        let mut k = vec![0.0; 9];
        k[4] = 1.0;
        conv.params_mut()[0].assign(k, &[3, 3, 1, 1]).expect("kernel");
        conv.params_mut()[1].assign(vec![0.5], &[1]).expect("bias");

        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], &[1, 3, 3, 1]);
        let y = conv.forward(&[&x], false).expect("forward");
        let expected: Vec<f32> = x.data().iter().map(|v| v + 0.5).collect();
        assert_eq!(y.data(), expected.as_slice());
    }

    #[test]
    fn test_conv_backward_matches_finite_difference() {
        clear_graph();
        let (mut conv, _) = built(Conv2d::new(2, (3, 3)).strides((2, 2)), &[5, 4, 2]);
        for p in conv.params_mut() {
            p.materialize().requires_grad_(true);
        }
        let x = crate::nn::init::uniform(&[1, 5, 4, 2], -1.0, 1.0, Some(9));
        let loss = conv.forward(&[&x], true).expect("forward").sum();
        loss.backward();

        let kernel = conv.params()[0].value().expect("kernel").clone();
        let grad = get_grad(kernel.id()).expect("kernel grad");
        let eps = 1e-2;
        for idx in [0, 7, 20, 35] {
            let mut plus = kernel.data().to_vec();
            plus[idx] += eps;
            let mut minus = kernel.data().to_vec();
            minus[idx] -= eps;
            let eval = |data: Vec<f32>| {
                let mut probe = conv.clone();
                probe.params_mut()[0].assign(data, kernel.shape()).expect("assign");
                crate::autograd::no_grad(|| probe.forward(&[&x], false).expect("forward").sum().item())
            };
            let numeric = (eval(plus) - eval(minus)) / (2.0 * eps);
            assert!((numeric - grad.data()[idx]).abs() < 1e-2, "idx {idx}: {numeric} vs {}", grad.data()[idx]);
        }
    }

    #[test]
    fn test_transposed_output_sizes() {
        let (_, out) = built(Conv2dTranspose::new(21, (4, 4), (2, 2)), &[16, 16, 21]);
        assert_eq!(out, vec![34, 34, 21]);
        let (_, out) = built(
            Conv2dTranspose::new(21, (4, 4), (2, 2)).padding(Padding::Same),
            &[16, 16, 21],
        );
        assert_eq!(out, vec![32, 32, 21]);
    }

    #[test]
    fn test_transposed_scatters_kernel() {
        let (mut deconv, _) = built(Conv2dTranspose::new(1, (2, 2), (2, 2)).use_bias(false), &[1, 2, 1]);
        deconv.params_mut()[0]
            .assign(vec![1.0, 2.0, 3.0, 4.0], &[2, 2, 1, 1])
            .expect("kernel");
        let x = Tensor::new(&[1.0, 10.0], &[1, 1, 2, 1]);
        let y = deconv.forward(&[&x], false).expect("forward");
        assert_eq!(y.shape(), &[1, 2, 4, 1]);
        assert_eq!(y.data(), &[1.0, 2.0, 10.0, 20.0, 3.0, 4.0, 30.0, 40.0]);
    }

    #[test]
    fn test_channels_first_matches_channels_last() {
        let kernel = crate::nn::init::uniform(&[3, 3, 2, 3], -1.0, 1.0, Some(5));
        let x_last = crate::nn::init::uniform(&[1, 4, 4, 2], -1.0, 1.0, Some(6));
        let mut x_first = vec![0.0; 32];
        for y in 0..4 {
            for x in 0..4 {
                for c in 0..2 {
                    x_first[(c * 4 + y) * 4 + x] = x_last.data()[(y * 4 + x) * 2 + c];
                }
            }
        }
        let x_first = Tensor::from_vec(x_first, &[1, 2, 4, 4]);

        let run = |format, shape: &[usize], x: &Tensor| {
            let mut conv = Conv2d::new(3, (3, 3)).use_bias(false);
            let mut ctx = BuildContext::new(format, None);
            conv.build(&[shape], &mut ctx).expect("build");
            conv.params_mut()[0]
                .assign(kernel.data().to_vec(), &[3, 3, 2, 3])
                .expect("kernel");
            conv.forward(&[x], false).expect("forward")
        };
        let last = run(DataFormat::ChannelsLast, &[4, 4, 2], &x_last);
        let first = run(DataFormat::ChannelsFirst, &[2, 4, 4], &x_first);
        for y in 0..4 {
            for x in 0..4 {
                for c in 0..3 {
                    let a = last.data()[(y * 4 + x) * 3 + c];
                    let b = first.data()[(c * 4 + y) * 4 + x];
                    assert!((a - b).abs() < 1e-5);
                }
            }
        }
    }

    #[test]
    fn test_flip_kernel_spatially() {
        let mut k = vec![1.0, 2.0, 3.0, 4.0];
        flip_kernel_spatially(&mut k, &[2, 2, 1, 1]).expect("flip");
        assert_eq!(k, vec![4.0, 3.0, 2.0, 1.0]);
        assert!(flip_kernel_spatially(&mut k, &[4]).is_err());
    }
}
