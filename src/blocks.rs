//! Layer stacks the encoders and decoders are assembled from.
//!
//! Encoder blocks map one tensor to the next ([`Block`]); decoder blocks
//! also receive the output of the previous decoder stage ([`DecoderBlock`]).
//! Layer names follow the pretrained VGG archives (`block3_conv2`, `fc6`)
//! so weights can be matched by name.

use crate::error::Result;
use crate::nn::{
    Activation, Add, BilinearUpSampling2D, Conv2d, Conv2dTranspose, CropOffset, CroppingLike2D,
    Dropout, Graph, Initializer, MaxPool2d, Padding, Scale, SymbolicTensor, ZeroPadding2D,
};

/// An encoder stage.
pub trait Block {
    /// Adds the stage's layers to `graph`, consuming `x`.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer rejects its input.
    fn apply(&self, graph: &mut Graph, x: &SymbolicTensor) -> Result<SymbolicTensor>;
}

impl<F> Block for F
where
    F: Fn(&mut Graph, &SymbolicTensor) -> Result<SymbolicTensor>,
{
    fn apply(&self, graph: &mut Graph, x: &SymbolicTensor) -> Result<SymbolicTensor> {
        self(graph, x)
    }
}

/// A decoder stage combining a pyramid feature `x` with the decoded
/// output `y` of the previous stage (`None` for the first stage).
pub trait DecoderBlock {
    /// Adds the stage's layers to `graph`.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer rejects its input.
    fn apply(
        &self,
        graph: &mut Graph,
        x: &SymbolicTensor,
        y: Option<&SymbolicTensor>,
    ) -> Result<SymbolicTensor>;
}

impl<F> DecoderBlock for F
where
    F: Fn(&mut Graph, &SymbolicTensor, Option<&SymbolicTensor>) -> Result<SymbolicTensor>,
{
    fn apply(
        &self,
        graph: &mut Graph,
        x: &SymbolicTensor,
        y: Option<&SymbolicTensor>,
    ) -> Result<SymbolicTensor> {
        self(graph, x, y)
    }
}

fn he_conv(filters: usize, kernel: (usize, usize), weight_decay: f32) -> Conv2d {
    Conv2d::new(filters, kernel)
        .kernel_initializer(Initializer::HeNormal)
        .kernel_l2(weight_decay)
}

/// VGG convolutional block: `convs` 3×3 ReLU convolutions named
/// `<block_name>_conv<i>`, then a 2×2 stride-2 max pooling named
/// `<block_name>_pool`.
///
/// Convolutions keep the spatial size. With `padding`, the first
/// convolution of `block1` instead sees the input zero-padded by 100 pixels
/// and uses no padding itself, the classic FCN trick that lets later crops
/// line up with the image.
#[must_use]
pub fn vgg_conv(filters: usize, convs: usize, padding: bool, weight_decay: f32, block_name: &str) -> Box<dyn Block> {
    let block_name = block_name.to_string();
    Box::new(move |graph: &mut Graph, x: &SymbolicTensor| {
        let mut x = x.clone();
        for i in 0..convs {
            let name = format!("{block_name}_conv{}", i + 1);
            let conv = he_conv(filters, (3, 3), weight_decay).activation(Activation::Relu);
            x = if padding && block_name == "block1" && i == 0 {
                let padded = graph.apply(ZeroPadding2D::new(100), &[&x])?;
                graph.apply_named(name, conv.padding(Padding::Valid), &[&padded])?
            } else {
                graph.apply_named(name, conv.padding(Padding::Same), &[&x])?
            };
        }
        graph.apply_named(
            format!("{block_name}_pool"),
            MaxPool2d::new((2, 2), (2, 2)).padding(Padding::Same),
            &[&x],
        )
    })
}

/// Fully convolutional replacement of VGG's dense layers.
///
/// `fc6` is a 7×7 ReLU convolution with dilation 2 and `fc7` a 1×1 ReLU
/// convolution, each followed by an automatically named 50% dropout.
#[must_use]
pub fn vgg_fc(filters: usize, weight_decay: f32) -> Box<dyn Block> {
    Box::new(move |graph: &mut Graph, x: &SymbolicTensor| {
        let fc6 = graph.apply_named(
            "fc6",
            he_conv(filters, (7, 7), weight_decay)
                .dilation((2, 2))
                .activation(Activation::Relu),
            &[x],
        )?;
        let drop6 = graph.apply(Dropout::new(0.5)?, &[&fc6])?;
        let fc7 = graph.apply_named(
            "fc7",
            he_conv(filters, (1, 1), weight_decay).activation(Activation::Relu),
            &[&drop6],
        )?;
        graph.apply(Dropout::new(0.5)?, &[&fc7])
    })
}

/// Options of [`vgg_deconv`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeconvOptions {
    /// Transposed convolution kernel
    pub kernel_size: (usize, usize),
    /// Transposed convolution stride
    pub strides: (usize, usize),
    /// Placement of the skip crop
    pub crop_offset: CropOffset,
    /// L2 factor of every kernel
    pub weight_decay: f32,
}

impl Default for DeconvOptions {
    fn default() -> Self {
        Self {
            kernel_size: (4, 4),
            strides: (2, 2),
            crop_offset: CropOffset::Centered,
            weight_decay: 0.0,
        }
    }
}

/// Learned-upsampling decoder stage.
///
/// Scales the feature `x` by `scale` (`scale_<b>`), scores it with a 1×1
/// convolution into `classes` maps (`score_<b>`), adds the previous stage
/// cropped to the score's size (`crop_<b>`), and upsamples with a
/// bias-free transposed convolution (`upscore_<b>`).
#[must_use]
pub fn vgg_deconv(classes: usize, scale: f32, options: DeconvOptions, block_name: &str) -> Box<dyn DecoderBlock> {
    let block_name = block_name.to_string();
    Box::new(
        move |graph: &mut Graph, x: &SymbolicTensor, y: Option<&SymbolicTensor>| {
            let scaled = graph.apply_named(format!("scale_{block_name}"), Scale::new(scale), &[x])?;
            let mut score = graph.apply_named(
                format!("score_{block_name}"),
                he_conv(classes, (1, 1), options.weight_decay),
                &[&scaled],
            )?;
            if let Some(y) = y {
                let target = graph.spatial_size(&score)?;
                let crop = graph.apply_named(
                    format!("crop_{block_name}"),
                    CroppingLike2D::new(target, options.crop_offset),
                    &[y],
                )?;
                score = graph.apply(Add::new(), &[&score, &crop])?;
            }
            graph.apply_named(
                format!("upscore_{block_name}"),
                Conv2dTranspose::new(classes, options.kernel_size, options.strides)
                    .padding(Padding::Valid)
                    .kernel_initializer(Initializer::HeNormal)
                    .kernel_l2(options.weight_decay)
                    .use_bias(false),
                &[&score],
            )
        },
    )
}

/// Bilinear decoder stage.
///
/// Scores the feature `x` with a 1×1 convolution (`score_<b>`); when a
/// previous stage `y` exists, the score is scaled by `scale` (`scale_<b>`)
/// and added to it. The sum is resized to `target_shape` (`upscore_<b>`).
#[must_use]
pub fn vgg_upsampling(
    classes: usize,
    target_shape: (usize, usize),
    scale: f32,
    weight_decay: f32,
    block_name: &str,
) -> Box<dyn DecoderBlock> {
    let block_name = block_name.to_string();
    Box::new(
        move |graph: &mut Graph, x: &SymbolicTensor, y: Option<&SymbolicTensor>| {
            let mut score = graph.apply_named(
                format!("score_{block_name}"),
                he_conv(classes, (1, 1), weight_decay).padding(Padding::Valid),
                &[x],
            )?;
            if let Some(y) = y {
                let scaled = graph.apply_named(format!("scale_{block_name}"), Scale::new(scale), &[&score])?;
                score = graph.apply(Add::new(), &[y, &scaled])?;
            }
            graph.apply_named(
                format!("upscore_{block_name}"),
                BilinearUpSampling2D::new(target_shape),
                &[&score],
            )
        },
    )
}

/// Final decoder stage: crops the decoded map `y` to the spatial size of
/// `x` (usually the input image) under the name `block_name`.
#[must_use]
pub fn vgg_score(crop_offset: CropOffset, block_name: &str) -> Box<dyn DecoderBlock> {
    let block_name = block_name.to_string();
    Box::new(
        move |graph: &mut Graph, x: &SymbolicTensor, y: Option<&SymbolicTensor>| {
            let y = y.ok_or_else(|| {
                crate::error::FcnError::InvalidArchitecture(format!(
                    "`{block_name}` needs a decoded input to crop"
                ))
            })?;
            let target = graph.spatial_size(x)?;
            graph.apply_named(block_name.clone(), CroppingLike2D::new(target, crop_offset), &[y])
        },
    )
}
