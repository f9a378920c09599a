//! Fully convolutional segmentation networks.
//!
//! `fcn_vgg16` and `fcn_vgg19` put a bilinear decoder on top of a VGG
//! encoder. Three pyramid levels (the `fc7` features, `pool4` and `pool3`)
//! are scored, merged with shrinking weights and resized up to the input
//! size, then a per-pixel softmax named `score` produces class
//! probabilities.
//!
//! # Example
//!
//! ```
//! use fcn::config::BackendConfig;
//! use fcn::models::{fcn_vgg16, FcnOptions};
//!
//! let options = FcnOptions {
//!     config: Some(BackendConfig::default()),
//!     ..FcnOptions::default()
//! };
//! let model = fcn_vgg16(&[500, 500, 3], 21, options)?;
//! assert_eq!(model.output_shape(), &[500, 500, 21]);
//! # Ok::<(), fcn::FcnError>(())
//! ```

use crate::config::BackendConfig;
use crate::decoders::vgg_upsampler;
use crate::encoders::{vgg, EncoderOptions, VggArchitecture, VGG16, VGG19};
use crate::error::{FcnError, Result};
use crate::nn::{Graph, Model, Softmax};

/// Weights of the merged pyramid levels, deepest first.
pub const PYRAMID_SCALES: [f32; 3] = [1.0, 1e-2, 1e-4];

/// Options of the FCN builders.
#[derive(Debug, Clone, PartialEq)]
pub struct FcnOptions {
    /// L2 factor of every kernel
    pub weight_decay: f32,
    /// `false` freezes the pretrained encoder layers
    pub trainable_encoder: bool,
    /// `Some("imagenet")` loads the published encoder weights
    pub weights: Option<String>,
    /// Backend configuration, read from the environment when `None`
    pub config: Option<BackendConfig>,
    /// Seed of every initializer and dropout mask
    pub seed: Option<u64>,
}

impl Default for FcnOptions {
    /// No weight decay, trainable encoder, no pretrained weights.
    fn default() -> Self {
        Self {
            weight_decay: 0.0,
            trainable_encoder: true,
            weights: None,
            config: None,
            seed: None,
        }
    }
}

/// FCN over an arbitrary VGG encoder.
///
/// `input_shape` is the per-sample image shape in the configured layout.
/// The model's output has the input's spatial size and `classes`
/// channels.
///
/// # Errors
///
/// Returns [`FcnError::InvalidArchitecture`] for zero classes, and any
/// encoder, weight-loading or build error.
pub fn fcn_vgg(
    arch: &VggArchitecture<'_>,
    input_shape: &[usize],
    classes: usize,
    options: FcnOptions,
) -> Result<Model> {
    if classes == 0 {
        return Err(FcnError::InvalidArchitecture("an FCN needs at least one class".into()));
    }
    let config = options.config.unwrap_or_else(BackendConfig::from_env);
    let mut graph = Graph::new(config);
    if let Some(seed) = options.seed {
        graph = graph.with_seed(seed);
    }

    let inputs = graph.input(input_shape)?;
    let encoder = vgg(
        &mut graph,
        &inputs,
        arch,
        &EncoderOptions {
            weight_decay: options.weight_decay,
            weights: options.weights,
            trainable: options.trainable_encoder,
        },
    )?;
    if encoder.outputs().len() < PYRAMID_SCALES.len() {
        return Err(FcnError::InvalidArchitecture(format!(
            "encoder `{}` yields {} feature maps, {} needed",
            encoder.name(),
            encoder.outputs().len(),
            PYRAMID_SCALES.len()
        )));
    }

    let mut pyramid: Vec<_> = encoder.outputs()[..PYRAMID_SCALES.len()].to_vec();
    pyramid.push(inputs.clone());
    let decoded = vgg_upsampler(&mut graph, &pyramid, &PYRAMID_SCALES, classes, options.weight_decay)?;
    let scores = graph.apply_named("score", Softmax::new(), &[&decoded])?;
    Model::new(graph, &[inputs], &[scores])
}

/// FCN with a VGG16 encoder.
///
/// # Errors
///
/// See [`fcn_vgg`].
pub fn fcn_vgg16(input_shape: &[usize], classes: usize, options: FcnOptions) -> Result<Model> {
    fcn_vgg(&VGG16, input_shape, classes, options)
}

/// FCN with a VGG19 encoder.
///
/// # Errors
///
/// See [`fcn_vgg`].
pub fn fcn_vgg19(input_shape: &[usize], classes: usize, options: FcnOptions) -> Result<Model> {
    fcn_vgg(&VGG19, input_shape, classes, options)
}
