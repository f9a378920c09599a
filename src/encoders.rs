//! Feature-pyramid encoders.
//!
//! An [`Encoder`] runs a list of blocks over an input and exposes the
//! intermediate feature maps deepest first. [`vgg_encoder`] builds the VGG
//! family from a [`VggArchitecture`]; [`vgg16`] and [`vgg19`] add the
//! ImageNet weight locations.
//!
//! # Example
//!
//! ```
//! use fcn::config::BackendConfig;
//! use fcn::encoders::{vgg16, EncoderOptions};
//! use fcn::nn::Graph;
//!
//! let mut graph = Graph::new(BackendConfig::default());
//! let x = graph.input(&[224, 224, 3])?;
//! let encoder = vgg16(&mut graph, &x, &EncoderOptions { weights: None, ..Default::default() })?;
//! assert_eq!(encoder.outputs()[0].shape(), &[7, 7, 4096]);
//! assert_eq!(encoder.outputs().len(), 5);
//! # Ok::<(), fcn::FcnError>(())
//! ```

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::blocks::{vgg_conv, vgg_fc, Block};
use crate::config::DataFormat;
use crate::error::{FcnError, Result};
use crate::fetch::{get_file, MODELS_SUBDIR};
use crate::nn::{Graph, Model, SymbolicTensor};
use crate::weights::{convert_all_kernels, freeze_layers, load_weights};

/// Output of an encoder: a feature pyramid plus what was loaded into it.
#[derive(Debug, Clone)]
pub struct Encoder {
    name: String,
    outputs: Vec<SymbolicTensor>,
    pretrained: Option<BTreeSet<String>>,
}

impl Encoder {
    /// Applies `blocks` to `inputs` and optionally loads pretrained weights.
    ///
    /// The last block is the fully convolutional top; the others are
    /// convolutional stages applied in order. Outputs are, deepest first:
    /// the top's output, then the convolutional stage outputs from the
    /// second-to-last down to the first. The last stage feeds the top and
    /// is not exposed itself, except when it is also the first stage.
    ///
    /// `weights` is the origin of a weight archive (URL, `file://` URL or
    /// path). It is cached as
    /// `<cache>/models/<name>_weights_tf_dim_ordering_tf_kernels.h5` and
    /// loaded by layer name; channels-first graphs get their kernels
    /// converted afterwards. With `trainable == false` every layer listed
    /// in the archive is frozen. Loading, conversion and freezing only
    /// touch the layers this call adds to `graph`.
    ///
    /// The VGG builders pass their architecture name (`vgg16`, `vgg19`),
    /// so the two families cache to different files instead of sharing
    /// the Keras default `encoder_weights_tf_dim_ordering_tf_kernels.h5`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::InvalidArchitecture`] for an empty block list,
    /// any block's build error, and fetch or load errors.
    pub fn new(
        graph: &mut Graph,
        inputs: &SymbolicTensor,
        blocks: &[Box<dyn Block>],
        weights: Option<&str>,
        trainable: bool,
        name: &str,
    ) -> Result<Self> {
        let Some((fc_block, conv_blocks)) = blocks.split_last() else {
            return Err(FcnError::InvalidArchitecture(format!(
                "encoder `{name}` needs at least one block"
            )));
        };

        let first_node = graph.len();
        let mut inverse_pyramid = Vec::with_capacity(blocks.len());
        let mut x = inputs.clone();
        for (i, block) in conv_blocks.iter().enumerate() {
            x = block.apply(graph, &x)?;
            if i == 0 || i + 1 < conv_blocks.len() {
                inverse_pyramid.push(x.clone());
            }
        }
        inverse_pyramid.push(fc_block.apply(graph, &x)?);
        inverse_pyramid.reverse();
        let own_nodes = first_node..graph.len();

        let pretrained = match weights {
            Some(origin) => {
                let fname = format!("{name}_weights_tf_dim_ordering_tf_kernels.h5");
                let path = get_file(&fname, origin, MODELS_SUBDIR, graph.config())?;
                let layer_names = load_weights(graph, &path, own_nodes.clone())?;
                if graph.data_format() == DataFormat::ChannelsFirst {
                    convert_all_kernels(graph, own_nodes.clone())?;
                }
                Some(layer_names.into_iter().collect::<BTreeSet<_>>())
            }
            None => None,
        };

        if !trainable {
            match &pretrained {
                Some(names) => freeze_layers(graph, names, own_nodes),
                None => warn!(encoder = name, "no pretrained weights loaded, nothing to freeze"),
            }
        }

        info!(
            encoder = name,
            outputs = inverse_pyramid.len(),
            pretrained = pretrained.is_some(),
            "built encoder"
        );
        Ok(Self {
            name: name.to_string(),
            outputs: inverse_pyramid,
            pretrained,
        })
    }

    /// Encoder name, also the prefix of its cached weight file.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Feature pyramid, deepest first.
    #[must_use]
    pub fn outputs(&self) -> &[SymbolicTensor] {
        &self.outputs
    }

    /// Layer names listed by the loaded archive, `None` without one.
    #[must_use]
    pub fn pretrained_layers(&self) -> Option<&BTreeSet<String>> {
        self.pretrained.as_ref()
    }

    /// Wraps `graph` into a model from `inputs` to the feature pyramid.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Model::new`].
    pub fn into_model(self, graph: Graph, inputs: &SymbolicTensor) -> Result<Model> {
        Model::new(graph, std::slice::from_ref(inputs), &self.outputs)
    }
}

/// Shape of a VGG network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VggArchitecture<'a> {
    /// Encoder name
    pub name: &'a str,
    /// Filters of each convolutional block
    pub filters: &'a [usize],
    /// Convolutions in each block, same length as `filters`
    pub convs: &'a [usize],
    /// Filters of `fc6` and `fc7`
    pub fc_filters: usize,
    /// Where `"imagenet"` weights live
    pub pretrained_url: Option<&'a str>,
}

/// VGG16: 13 convolutions in five blocks.
pub const VGG16: VggArchitecture<'static> = VggArchitecture {
    name: "vgg16",
    filters: &[64, 128, 256, 512, 512],
    convs: &[2, 2, 3, 3, 3],
    fc_filters: 4096,
    pretrained_url: Some(
        "https://github.com/fchollet/deep-learning-models/releases/download/v0.1/vgg16_weights_tf_dim_ordering_tf_kernels_notop.h5",
    ),
};

/// VGG19: 16 convolutions in five blocks.
pub const VGG19: VggArchitecture<'static> = VggArchitecture {
    name: "vgg19",
    filters: &[64, 128, 256, 512, 512],
    convs: &[2, 2, 4, 4, 4],
    fc_filters: 4096,
    pretrained_url: Some(
        "https://github.com/fchollet/deep-learning-models/releases/download/v0.1/vgg19_weights_tf_dim_ordering_tf_kernels_notop.h5",
    ),
};

/// Builds a VGG encoder: one [`vgg_conv`] block per `(filters, convs)`
/// pair named `block1..blockN`, then [`vgg_fc`].
///
/// `weights` is an archive origin as in [`Encoder::new`].
///
/// # Errors
///
/// Returns [`FcnError::InvalidArchitecture`] if `filters` and `convs`
/// differ in length or are empty, plus the errors of [`Encoder::new`].
pub fn vgg_encoder(
    graph: &mut Graph,
    inputs: &SymbolicTensor,
    arch: &VggArchitecture<'_>,
    weight_decay: f32,
    weights: Option<&str>,
    trainable: bool,
) -> Result<Encoder> {
    if arch.filters.len() != arch.convs.len() {
        return Err(FcnError::InvalidArchitecture(format!(
            "`filters` has {} entries but `convs` has {}",
            arch.filters.len(),
            arch.convs.len()
        )));
    }
    if arch.filters.is_empty() {
        return Err(FcnError::InvalidArchitecture(
            "a VGG encoder needs at least one convolutional block".into(),
        ));
    }

    let mut blocks: Vec<Box<dyn Block>> = arch
        .filters
        .iter()
        .zip(arch.convs)
        .enumerate()
        .map(|(i, (&filters, &convs))| {
            vgg_conv(filters, convs, false, weight_decay, &format!("block{}", i + 1))
        })
        .collect();
    blocks.push(vgg_fc(arch.fc_filters, weight_decay));

    Encoder::new(graph, inputs, &blocks, weights, trainable, arch.name)
}

/// Options of [`vgg16`] and [`vgg19`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderOptions {
    /// L2 factor of every kernel
    pub weight_decay: f32,
    /// `Some("imagenet")` loads the published weights; anything else
    /// loads nothing
    pub weights: Option<String>,
    /// `false` freezes the pretrained layers
    pub trainable: bool,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            weight_decay: 0.0,
            weights: Some("imagenet".to_string()),
            trainable: true,
        }
    }
}

fn pretrained_origin<'a>(arch: &VggArchitecture<'a>, weights: Option<&str>) -> Option<&'a str> {
    match weights {
        Some("imagenet") => arch.pretrained_url,
        Some(other) => {
            warn!(encoder = arch.name, weights = other, "only \"imagenet\" weights are known, ignoring");
            None
        }
        None => None,
    }
}

/// VGG encoder of any architecture with `"imagenet"` resolved to
/// `arch.pretrained_url`.
///
/// # Errors
///
/// Returns the errors of [`vgg_encoder`].
pub fn vgg(
    graph: &mut Graph,
    inputs: &SymbolicTensor,
    arch: &VggArchitecture<'_>,
    options: &EncoderOptions,
) -> Result<Encoder> {
    let origin = pretrained_origin(arch, options.weights.as_deref());
    vgg_encoder(graph, inputs, arch, options.weight_decay, origin, options.trainable)
}

/// VGG16 feature encoder.
///
/// # Errors
///
/// Returns the errors of [`vgg_encoder`].
pub fn vgg16(graph: &mut Graph, inputs: &SymbolicTensor, options: &EncoderOptions) -> Result<Encoder> {
    vgg(graph, inputs, &VGG16, options)
}

/// VGG19 feature encoder.
///
/// # Errors
///
/// Returns the errors of [`vgg_encoder`].
pub fn vgg19(graph: &mut Graph, inputs: &SymbolicTensor, options: &EncoderOptions) -> Result<Encoder> {
    vgg(graph, inputs, &VGG19, options)
}
