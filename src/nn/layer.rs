//! The layer abstraction shared by every graph node.
//!
//! A layer is built once against the static per-sample shapes of its inputs
//! (batch excluded), which fixes its output shape and declares its
//! parameters. Parameter values are materialised lazily, so large
//! architectures can be built and inspected without allocating weights.

use super::init;
use crate::autograd::Tensor;
use crate::config::DataFormat;
use crate::error::{FcnError, Result};

/// Role of a parameter inside its layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// Convolution kernel; subject to kernel conversion and L2 penalties.
    Kernel,
    /// Additive bias.
    Bias,
}

/// Initialisation scheme for a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initializer {
    /// Truncated normal scaled by `sqrt(2 / fan_in)`.
    HeNormal,
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform,
    /// All zeros.
    Zeros,
}

impl Initializer {
    fn sample(self, shape: &[usize], seed: Option<u64>) -> Tensor {
        let (fan_in, fan_out) = init::fans(shape);
        match self {
            Self::HeNormal => init::he_normal(shape, fan_in, seed),
            Self::GlorotUniform => init::glorot_uniform(shape, fan_in, fan_out, seed),
            Self::Zeros => init::zeros(shape),
        }
    }
}

/// A named weight slot of a layer.
#[derive(Debug, Clone)]
pub struct Parameter {
    name: &'static str,
    role: ParamRole,
    shape: Vec<usize>,
    initializer: Initializer,
    l2: f32,
    seed: Option<u64>,
    value: Option<Tensor>,
}

impl Parameter {
    pub(crate) fn kernel(shape: Vec<usize>, initializer: Initializer, l2: f32, seed: Option<u64>) -> Self {
        Self {
            name: "kernel:0",
            role: ParamRole::Kernel,
            shape,
            initializer,
            l2,
            seed,
            value: None,
        }
    }

    pub(crate) fn bias(len: usize) -> Self {
        Self {
            name: "bias:0",
            role: ParamRole::Bias,
            shape: vec![len],
            initializer: Initializer::Zeros,
            l2: 0.0,
            seed: None,
            value: None,
        }
    }

    /// Weight name relative to its layer, e.g. `kernel:0`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Role of the parameter.
    #[must_use]
    pub fn role(&self) -> ParamRole {
        self.role
    }

    /// Declared shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// L2 penalty factor (0 disables the penalty).
    #[must_use]
    pub fn l2(&self) -> f32 {
        self.l2
    }

    /// Current value, `None` until initialised or assigned.
    #[must_use]
    pub fn value(&self) -> Option<&Tensor> {
        self.value.as_ref()
    }

    /// True once the parameter holds a value.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.value.is_some()
    }

    /// Replaces the value.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::ShapeMismatch`] if `shape` differs from the
    /// declared shape or `data` does not fill it.
    pub fn assign(&mut self, data: Vec<f32>, shape: &[usize]) -> Result<()> {
        if shape != self.shape.as_slice() || data.len() != self.numel() {
            return Err(FcnError::shape(
                format!("assignment to `{}`", self.name),
                &self.shape,
                shape,
            ));
        }
        let requires_grad = self.value.as_ref().is_some_and(Tensor::requires_grad_enabled);
        let mut tensor = Tensor::from_vec(data, shape);
        tensor.requires_grad_(requires_grad);
        self.value = Some(tensor);
        Ok(())
    }

    /// Number of scalar values.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Initialises the value from the initializer if it is still unset.
    pub(crate) fn materialize(&mut self) -> &mut Tensor {
        let (initializer, shape, seed) = (self.initializer, &self.shape, self.seed);
        self.value
            .get_or_insert_with(|| initializer.sample(shape, seed))
    }

    pub(crate) fn value_mut(&mut self) -> Option<&mut Tensor> {
        self.value.as_mut()
    }

    /// Value for a forward pass.
    pub(crate) fn tensor(&self) -> Result<&Tensor> {
        self.value.as_ref().ok_or_else(|| {
            FcnError::InvalidArchitecture(format!("parameter `{}` used before initialisation", self.name))
        })
    }
}

/// State handed to [`Layer::build`].
#[derive(Debug)]
pub struct BuildContext {
    format: DataFormat,
    seed: Option<u64>,
    issued: u64,
}

impl BuildContext {
    pub(crate) fn new(format: DataFormat, seed: Option<u64>) -> Self {
        Self {
            format,
            seed,
            issued: 0,
        }
    }

    /// Image layout of the graph being built.
    #[must_use]
    pub fn format(&self) -> DataFormat {
        self.format
    }

    /// Derives a fresh seed for one random source; `None` when the graph is unseeded.
    pub fn next_seed(&mut self) -> Option<u64> {
        let base = self.seed?;
        self.issued += 1;
        Some(base.wrapping_add(self.issued.wrapping_mul(0x9E37_79B9_7F4A_7C15)))
    }
}

/// A node operation in a [`Graph`](super::Graph).
pub trait Layer: Send + Sync {
    /// Class name, also the prefix of automatically generated layer names.
    fn kind(&self) -> &'static str;

    /// Validates the per-sample input shapes, declares parameters, and
    /// returns the per-sample output shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs are incompatible with the layer.
    fn build(&mut self, input_shapes: &[&[usize]], ctx: &mut BuildContext) -> Result<Vec<usize>>;

    /// Computes the output for a batch. Parameters are materialised beforehand.
    ///
    /// # Errors
    ///
    /// Returns an error if the input tensors do not match the built shapes.
    fn forward(&self, inputs: &[&Tensor], training: bool) -> Result<Tensor>;

    /// Parameters in weight order.
    fn params(&self) -> &[Parameter] {
        &[]
    }

    /// Mutable parameters in weight order.
    fn params_mut(&mut self) -> &mut [Parameter] {
        &mut []
    }

    /// True for spatial convolutions whose kernels are flipped when
    /// converting between backends.
    fn is_convolution(&self) -> bool {
        false
    }
}

/// Spatial geometry of a per-sample image shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDims {
    /// Rows
    pub height: usize,
    /// Columns
    pub width: usize,
    /// Channels
    pub channels: usize,
}

impl ImageDims {
    /// Reads a per-sample 3-D shape in the given layout.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::ShapeMismatch`] for non-image shapes.
    pub fn from_shape(shape: &[usize], format: DataFormat) -> Result<Self> {
        let [a, b, c] = shape else {
            return Err(FcnError::shape("image input", "3-D per-sample shape", shape));
        };
        Ok(match format {
            DataFormat::ChannelsLast => Self {
                height: *a,
                width: *b,
                channels: *c,
            },
            DataFormat::ChannelsFirst => Self {
                height: *b,
                width: *c,
                channels: *a,
            },
        })
    }

    /// Per-sample shape in the given layout.
    #[must_use]
    pub fn to_shape(self, format: DataFormat) -> Vec<usize> {
        match format {
            DataFormat::ChannelsLast => vec![self.height, self.width, self.channels],
            DataFormat::ChannelsFirst => vec![self.channels, self.height, self.width],
        }
    }
}

/// Flat indexing into a batched 4-D image tensor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Indexer {
    pub dims: ImageDims,
    pub format: DataFormat,
}

impl Indexer {
    pub fn new(dims: ImageDims, format: DataFormat) -> Self {
        Self { dims, format }
    }

    #[inline]
    pub fn at(&self, b: usize, y: usize, x: usize, c: usize) -> usize {
        let ImageDims {
            height: h,
            width: w,
            channels: ch,
        } = self.dims;
        match self.format {
            DataFormat::ChannelsLast => ((b * h + y) * w + x) * ch + c,
            DataFormat::ChannelsFirst => ((b * ch + c) * h + y) * w + x,
        }
    }

    pub fn batch_shape(&self, batch: usize) -> Vec<usize> {
        let mut shape = vec![batch];
        shape.extend(self.dims.to_shape(self.format));
        shape
    }
}

/// Renders a per-sample shape with an unknown batch, e.g. `(None, 16, 16, 4096)`.
#[must_use]
pub fn format_shape(shape: &[usize]) -> String {
    let dims: Vec<String> = shape.iter().map(ToString::to_string).collect();
    format!("(None, {})", dims.join(", "))
}

pub(crate) fn single_input<'a>(input_shapes: &[&'a [usize]], kind: &str) -> Result<&'a [usize]> {
    match input_shapes {
        [shape] => Ok(shape),
        _ => Err(FcnError::InvalidArchitecture(format!(
            "{kind} takes exactly one input, got {}",
            input_shapes.len()
        ))),
    }
}

/// Checks a batched input against the built per-sample shape.
pub(crate) fn check_batch(input: &Tensor, expected: &[usize], kind: &str) -> Result<usize> {
    let shape = input.shape();
    if shape.len() != expected.len() + 1 || &shape[1..] != expected || shape[0] == 0 {
        return Err(FcnError::shape(kind, format!("(batch, {expected:?})"), shape));
    }
    Ok(shape[0])
}
