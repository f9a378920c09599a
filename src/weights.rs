//! Assigning archived weights to a layer graph.
//!
//! Weights are matched by layer name, so an archive written for a plain
//! VGG classifier loads into the encoder of an FCN: layers absent from the
//! graph (the dense classifier) are skipped and graph layers absent from
//! the archive (the decoder) keep their initial values.
//!
//! Each function takes the range of graph nodes it may touch, so an
//! encoder only loads, converts and freezes the layers it built itself.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::{FcnError, Result};
use crate::nn::{flip_kernel_spatially, Graph};
use crate::serialization::{open_archive, StoredWeight};

/// One archived array bound for a parameter slot.
struct PendingValue {
    node: usize,
    slot: usize,
    weight: StoredWeight,
}

/// Layer name to node id over the nodes in `nodes`.
fn layer_index(graph: &Graph, nodes: Range<usize>) -> HashMap<&str, usize> {
    let nodes = scoped(graph, nodes);
    let start = nodes.start;
    graph.nodes()[nodes]
        .iter()
        .enumerate()
        .map(|(offset, n)| (n.name.as_str(), start + offset))
        .collect()
}

/// Clamps `nodes` to the graph.
fn scoped(graph: &Graph, nodes: Range<usize>) -> Range<usize> {
    let end = nodes.end.min(graph.len());
    nodes.start.min(end)..end
}

/// Loads the archive at `path` by layer name into the nodes of `graph`
/// whose ids fall in `nodes`.
///
/// Every value is validated before any is assigned, so a failing load
/// leaves the graph untouched. Returns the layer names listed by the
/// archive, in archive order.
///
/// # Errors
///
/// Returns archive and I/O errors, [`FcnError::WeightCountMismatch`] when
/// the archive holds more weights for a layer than it has, and
/// [`FcnError::ShapeMismatch`] when an array does not fit its slot.
pub fn load_weights(graph: &mut Graph, path: &Path, nodes: Range<usize>) -> Result<Vec<String>> {
    info!(path = %path.display(), "Loading weights...");
    let archive = open_archive(path)?;
    let layer_names = archive.layer_names().to_vec();
    let index = layer_index(graph, nodes);

    let mut pending = Vec::new();
    for name in &layer_names {
        let Some(&node) = index.get(name.as_str()) else {
            debug!(layer = %name, "archive layer not in graph");
            continue;
        };
        let weights = archive.layer_weights(name)?;
        let params = graph.nodes()[node].layer.params();
        if weights.len() > params.len() {
            return Err(FcnError::WeightCountMismatch {
                layer: name.clone(),
                expected: params.len(),
                stored: weights.len(),
            });
        }
        for (slot, (weight, param)) in weights.into_iter().zip(params).enumerate() {
            if weight.shape != param.shape() {
                return Err(FcnError::shape(
                    format!("{name}/{}", param.name()),
                    param.shape(),
                    &weight.shape,
                ));
            }
            pending.push(PendingValue { node, slot, weight });
        }
    }

    let assigned = pending.len();
    batch_set_value(graph, pending)?;
    debug!(layers = layer_names.len(), assigned, "weights loaded");
    Ok(layer_names)
}

fn batch_set_value(graph: &mut Graph, pending: Vec<PendingValue>) -> Result<()> {
    let nodes = graph.nodes_mut();
    for PendingValue { node, slot, weight } in pending {
        nodes[node].layer.params_mut()[slot].assign(weight.data, &weight.shape)?;
    }
    Ok(())
}

/// Flips the spatial axes of every initialised convolution kernel among
/// the nodes in `nodes`.
///
/// Archives written by a backend that implements convolution as true
/// convolution store kernels rotated by 180°; channels-first archives
/// from such backends need this after loading.
///
/// # Errors
///
/// Returns [`FcnError::ShapeMismatch`] if a convolution kernel is not 4-D.
pub fn convert_all_kernels(graph: &mut Graph, nodes: Range<usize>) -> Result<()> {
    let nodes = scoped(graph, nodes);
    let mut flipped = 0usize;
    for node in &mut graph.nodes_mut()[nodes] {
        if !node.layer.is_convolution() {
            continue;
        }
        if let Some(kernel) = node.layer.params_mut().first_mut() {
            let shape = kernel.shape().to_vec();
            if let Some(value) = kernel.value_mut() {
                flip_kernel_spatially(value.data_mut(), &shape)?;
                flipped += 1;
            }
        }
    }
    debug!(flipped, "converted convolution kernels");
    Ok(())
}

/// Marks every layer among the nodes in `nodes` that is named in `names`
/// as not trainable.
///
/// Names with no layer in that range are ignored.
pub fn freeze_layers(graph: &mut Graph, names: &BTreeSet<String>, nodes: Range<usize>) {
    let nodes = scoped(graph, nodes);
    let mut frozen = 0usize;
    for node in &mut graph.nodes_mut()[nodes] {
        if names.contains(&node.name) {
            node.trainable = false;
            frozen += 1;
        }
    }
    if frozen == 0 && !names.is_empty() {
        warn!("none of the {} pretrained layers are in the graph", names.len());
    }
    debug!(frozen, "froze pretrained layers");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::nn::Conv2d;
    use crate::serialization::save_weight_archive;

    fn graph() -> Graph {
        let mut g = Graph::new(BackendConfig::default()).with_seed(1);
        let x = g.input(&[6, 6, 2]).expect("input");
        let y = g.apply_named("conv_a", Conv2d::new(3, (3, 3)), &[&x]).expect("a");
        g.apply_named("conv_b", Conv2d::new(1, (1, 1)), &[&y]).expect("b");
        g
    }

    fn kernel(name: &str, shape: Vec<usize>, fill: f32) -> StoredWeight {
        let n = shape.iter().product();
        StoredWeight::new(format!("{name}/kernel:0"), shape, vec![fill; n]).expect("weight")
    }

    #[test]
    fn test_load_matches_by_name_and_skips_unknown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("w.safetensors");
        save_weight_archive(
            &path,
            &[
                ("conv_a".to_string(), vec![kernel("conv_a", vec![3, 3, 2, 3], 0.25)]),
                ("predictions".to_string(), vec![kernel("predictions", vec![4, 4], 1.0)]),
            ],
        )
        .expect("save");

        let mut g = graph();
        let all = 0..g.len();
        let names = load_weights(&mut g, &path, all).expect("load");
        assert_eq!(names, vec!["conv_a".to_string(), "predictions".to_string()]);

        let a = g.get_layer("conv_a").expect("conv_a");
        assert!(a.params()[0].value().expect("kernel").data().iter().all(|&v| v == 0.25));
        // Bias slot not in the archive stays unset
        assert!(!a.params()[1].is_initialized());
        assert!(!g.get_layer("conv_b").expect("conv_b").params()[0].is_initialized());
    }

    #[test]
    fn test_load_is_atomic_on_shape_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("w.safetensors");
        save_weight_archive(
            &path,
            &[
                ("conv_a".to_string(), vec![kernel("conv_a", vec![3, 3, 2, 3], 1.0)]),
                ("conv_b".to_string(), vec![kernel("conv_b", vec![1, 1, 3, 2], 1.0)]),
            ],
        )
        .expect("save");

        let mut g = graph();
        let all = 0..g.len();
        let err = load_weights(&mut g, &path, all).expect_err("shape error");
        assert!(matches!(err, FcnError::ShapeMismatch { .. }), "{err}");
        assert!(!g.get_layer("conv_a").expect("conv_a").params()[0].is_initialized());
    }

    #[test]
    fn test_too_many_weights_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("w.safetensors");
        let b = |i: usize| StoredWeight::new(format!("conv_b/w{i}"), vec![1], vec![0.0]).expect("w");
        save_weight_archive(&path, &[("conv_b".to_string(), vec![b(0), b(1), b(2)])]).expect("save");

        let mut g = graph();
        let all = 0..g.len();
        let err = load_weights(&mut g, &path, all).expect_err("count");
        assert!(matches!(
            err,
            FcnError::WeightCountMismatch { expected: 2, stored: 3, .. }
        ));
    }

    #[test]
    fn test_convert_all_kernels_flips_spatial_axes() {
        let mut g = graph();
        let values: Vec<f32> = (0..18).map(|i| i as f32).collect();
        g.get_layer_mut("conv_a").expect("conv_a").params_mut()[0]
            .assign(values.iter().flat_map(|&v| [v, v, v]).collect(), &[3, 3, 2, 3])
            .expect("assign");
        let all = 0..g.len();
        convert_all_kernels(&mut g, all).expect("convert");

        let k = g.get_layer("conv_a").expect("conv_a").params()[0].value().expect("k").data().to_vec();
        // Position (0, 0) now holds what was at (2, 2)
        assert_eq!(k[0], 16.0);
        assert_eq!(k[6 * 8], 0.0);
    }

    #[test]
    fn test_freeze_layers() {
        let mut g = graph();
        let names: BTreeSet<String> = ["conv_a".to_string(), "fc8".to_string()].into();
        let all = 0..g.len();
        freeze_layers(&mut g, &names, all);
        assert!(!g.is_trainable("conv_a").expect("conv_a"));
        assert!(g.is_trainable("conv_b").expect("conv_b"));
    }

    #[test]
    fn test_nodes_outside_the_range_are_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("w.safetensors");
        save_weight_archive(
            &path,
            &[
                ("conv_a".to_string(), vec![kernel("conv_a", vec![3, 3, 2, 3], 0.5)]),
                ("conv_b".to_string(), vec![kernel("conv_b", vec![1, 1, 3, 1], 0.5)]),
            ],
        )
        .expect("save");

        // Node 0 is the input and node 1 is conv_a
        let mut g = graph();
        let end = g.len();
        load_weights(&mut g, &path, 2..end).expect("load");
        assert!(!g.get_layer("conv_a").expect("conv_a").params()[0].is_initialized());
        assert!(g.get_layer("conv_b").expect("conv_b").params()[0].is_initialized());

        let names: BTreeSet<String> = ["conv_a".to_string(), "conv_b".to_string()].into();
        freeze_layers(&mut g, &names, 2..end);
        assert!(g.is_trainable("conv_a").expect("conv_a"));
        assert!(!g.is_trainable("conv_b").expect("conv_b"));

        g.get_layer_mut("conv_a").expect("conv_a").params_mut()[0]
            .assign((0..54).map(|i| i as f32).collect(), &[3, 3, 2, 3])
            .expect("assign");
        convert_all_kernels(&mut g, 2..end).expect("convert");
        let k = g.get_layer("conv_a").expect("conv_a").params()[0].value().expect("k").data().to_vec();
        assert_eq!(k[0], 0.0);
    }
}
