//! Evaluation metrics.

use super::loss::channel_axis;
use crate::autograd::grad_fn::split_axis;
use crate::autograd::Tensor;
use crate::config::DataFormat;
use crate::error::{FcnError, Result};

/// Fraction of pixels whose most probable class matches the target's.
///
/// Ties resolve to the lowest class index.
///
/// # Errors
///
/// Returns [`FcnError::ShapeMismatch`] if the shapes differ or are not 4-D.
pub fn pixel_accuracy(pred: &Tensor, target: &Tensor, format: DataFormat) -> Result<f32> {
    if pred.shape() != target.shape() || pred.ndim() != 4 {
        return Err(FcnError::shape("pixel accuracy", pred.shape(), target.shape()));
    }
    let (outer, len, inner) = split_axis(pred.shape(), channel_axis(format));
    let argmax = |data: &[f32], o: usize, i: usize| {
        (0..len).fold(0, |best, k| {
            if data[(o * len + k) * inner + i] > data[(o * len + best) * inner + i] {
                k
            } else {
                best
            }
        })
    };

    let mut correct = 0usize;
    for o in 0..outer {
        for i in 0..inner {
            if argmax(pred.data(), o, i) == argmax(target.data(), o, i) {
                correct += 1;
            }
        }
    }
    Ok(correct as f32 / (outer * inner) as f32)
}
