//! FCN: fully convolutional networks for semantic segmentation in pure Rust.
//!
//! The crate builds VGG-based FCN models as named layer graphs, loads
//! pretrained Keras weight archives into them by layer name, and trains
//! them with a small reverse-mode autograd engine.
//!
//! # Quick Start
//!
//! ```
//! use fcn::prelude::*;
//!
//! // Build an FCN for 4 classes; nothing is allocated until first use
//! let options = FcnOptions {
//!     config: Some(BackendConfig::default()),
//!     ..FcnOptions::default()
//! };
//! let model = fcn_vgg16(&[64, 64, 3], 4, options).unwrap();
//!
//! assert_eq!(model.output_shape(), &[64, 64, 4]);
//! assert_eq!(model.layer_output_shape("block5_pool").unwrap(), &[2, 2, 512]);
//! ```
//!
//! # Modules
//!
//! - [`autograd`]: Tensors and reverse-mode differentiation
//! - [`nn`]: Layers, symbolic graphs, models, losses and optimizers
//! - [`blocks`]: VGG encoder and decoder stages
//! - [`encoders`]: Feature-pyramid encoders (VGG16, VGG19)
//! - [`decoders`]: Learned and bilinear decoders
//! - [`models`]: Complete FCN models
//! - [`weights`]: Loading weight archives by layer name
//! - [`serialization`]: HDF5 and `SafeTensors` weight archives
//! - [`fetch`]: Cached download of pretrained archives
//! - [`config`]: Backend configuration (`image_data_format`, cache directory)

pub mod autograd;
pub mod blocks;
pub mod config;
pub mod decoders;
pub mod encoders;
pub mod error;
pub mod fetch;
pub mod models;
pub mod nn;
pub mod prelude;
pub mod serialization;
pub mod weights;

pub use error::{FcnError, Result};
