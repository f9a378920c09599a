//! Convenience re-exports for common usage.
//!
//! # Usage
//!
//! ```
//! use fcn::prelude::*;
//! ```

pub use crate::autograd::Tensor;
pub use crate::blocks::{vgg_conv, vgg_deconv, vgg_fc, vgg_score, vgg_upsampling, Block, DecoderBlock};
pub use crate::config::{BackendConfig, DataFormat};
pub use crate::decoders::{decoder, vgg_decoder, vgg_upsampler};
pub use crate::encoders::{vgg16, vgg19, vgg_encoder, Encoder, EncoderOptions, VggArchitecture};
pub use crate::error::{FcnError, Result};
pub use crate::models::{fcn_vgg16, fcn_vgg19, FcnOptions};
pub use crate::nn::optim::{Optimizer, RMSprop, SGD};
pub use crate::nn::{Graph, Model, SymbolicTensor};
