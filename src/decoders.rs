//! Decoders folding a feature pyramid back to a dense prediction.
//!
//! A decoder walks the pyramid deepest first; each stage sees one pyramid
//! level plus what the previous stages decoded.

use crate::blocks::{vgg_deconv, vgg_score, vgg_upsampling, DeconvOptions, DecoderBlock};
use crate::error::{FcnError, Result};
use crate::nn::{CropOffset, Graph, SymbolicTensor};

/// Applies `blocks[i]` to `pyramid[i]` and the running decoded tensor.
///
/// # Errors
///
/// Returns [`FcnError::InvalidArchitecture`] if the lengths differ or
/// are zero, plus any block's build error.
pub fn decoder(
    graph: &mut Graph,
    pyramid: &[SymbolicTensor],
    blocks: &[Box<dyn DecoderBlock>],
) -> Result<SymbolicTensor> {
    if pyramid.len() != blocks.len() {
        return Err(FcnError::InvalidArchitecture(format!(
            "{} pyramid levels but {} decoder blocks",
            pyramid.len(),
            blocks.len()
        )));
    }
    let mut decoded: Option<SymbolicTensor> = None;
    for (feature, block) in pyramid.iter().zip(blocks) {
        decoded = Some(block.apply(graph, feature, decoded.as_ref())?);
    }
    decoded.ok_or_else(|| FcnError::InvalidArchitecture("empty feature pyramid".into()))
}

fn check_scales(pyramid: &[SymbolicTensor], scales: &[f32]) -> Result<()> {
    if scales.len() + 1 != pyramid.len() {
        return Err(FcnError::InvalidArchitecture(format!(
            "expected {} scales for a pyramid of {} levels, got {}",
            pyramid.len().saturating_sub(1),
            pyramid.len(),
            scales.len()
        )));
    }
    Ok(())
}

/// Learned-upsampling decoder (FCN-32s/16s/8s style).
///
/// One [`vgg_deconv`] stage per scale (`feat1`, `feat2`, ...) over all but
/// the last pyramid level, then a `score` crop to the last level, usually
/// the input image.
///
/// # Errors
///
/// Returns [`FcnError::InvalidArchitecture`] unless
/// `scales.len() == pyramid.len() - 1`, plus build errors.
pub fn vgg_decoder(
    graph: &mut Graph,
    pyramid: &[SymbolicTensor],
    scales: &[f32],
    classes: usize,
) -> Result<SymbolicTensor> {
    check_scales(pyramid, scales)?;
    let mut blocks: Vec<Box<dyn DecoderBlock>> = scales
        .iter()
        .enumerate()
        .map(|(i, &scale)| vgg_deconv(classes, scale, DeconvOptions::default(), &format!("feat{}", i + 1)))
        .collect();
    blocks.push(vgg_score(CropOffset::Centered, "score"));
    decoder(graph, pyramid, &blocks)
}

/// Bilinear decoder: stage `i` scores `pyramid[i]`, merges the previous
/// stage and resizes to the spatial size of `pyramid[i + 1]`.
///
/// The last pyramid level only provides the final output size.
///
/// # Errors
///
/// Returns [`FcnError::InvalidArchitecture`] unless
/// `scales.len() == pyramid.len() - 1`, plus build errors.
pub fn vgg_upsampler(
    graph: &mut Graph,
    pyramid: &[SymbolicTensor],
    scales: &[f32],
    classes: usize,
    weight_decay: f32,
) -> Result<SymbolicTensor> {
    check_scales(pyramid, scales)?;
    let mut blocks: Vec<Box<dyn DecoderBlock>> = Vec::with_capacity(scales.len());
    for (i, &scale) in scales.iter().enumerate() {
        let target = graph.spatial_size(&pyramid[i + 1])?;
        blocks.push(vgg_upsampling(classes, target, scale, weight_decay, &format!("feat{}", i + 1)));
    }
    decoder(graph, &pyramid[..scales.len()], &blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn pyramid(g: &mut Graph) -> Vec<SymbolicTensor> {
        vec![
            g.input(&[4, 4, 8]).expect("deep"),
            g.input(&[9, 9, 8]).expect("mid"),
            g.input(&[20, 20, 3]).expect("image"),
        ]
    }

    #[test]
    fn test_vgg_decoder_ends_at_image_size() {
        let mut g = Graph::new(BackendConfig::default());
        let p = pyramid(&mut g);
        let out = vgg_decoder(&mut g, &p, &[1.0, 0.01], 5).expect("decoder");
        assert_eq!(out.shape(), &[20, 20, 5]);
        assert_eq!(g.layer_output_shape("upscore_feat1").expect("feat1"), &[10, 10, 5]);
        assert_eq!(g.layer_output_shape("crop_feat2").expect("crop"), &[9, 9, 5]);
        assert!(g.contains("score"));
        assert!(!g.contains("crop_feat1"));
    }

    #[test]
    fn test_vgg_upsampler_targets_next_level() {
        let mut g = Graph::new(BackendConfig::default());
        let p = pyramid(&mut g);
        let out = vgg_upsampler(&mut g, &p, &[1.0, 0.01], 5, 0.0).expect("upsampler");
        assert_eq!(out.shape(), &[20, 20, 5]);
        assert_eq!(g.layer_output_shape("upscore_feat1").expect("feat1"), &[9, 9, 5]);
        assert!(g.contains("scale_feat2"));
        assert!(g.contains("add_1"));
    }

    #[test]
    fn test_length_checks() {
        let mut g = Graph::new(BackendConfig::default());
        let p = pyramid(&mut g);
        assert!(matches!(
            vgg_decoder(&mut g, &p, &[1.0], 5),
            Err(FcnError::InvalidArchitecture(_))
        ));
        assert!(matches!(
            vgg_upsampler(&mut g, &p, &[1.0, 1.0, 1.0], 5, 0.0),
            Err(FcnError::InvalidArchitecture(_))
        ));
        let one: Vec<Box<dyn DecoderBlock>> = vec![vgg_score(CropOffset::Centered, "score")];
        assert!(matches!(decoder(&mut g, &p, &one), Err(FcnError::InvalidArchitecture(_))));
        assert!(decoder(&mut g, &[], &[]).is_err());
    }
}
