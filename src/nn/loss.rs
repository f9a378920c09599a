//! Differentiable loss functions for segmentation training.
//!
//! # Example
//!
//! ```
//! use fcn::autograd::{get_grad, Tensor};
//! use fcn::config::DataFormat;
//! use fcn::nn::loss::CategoricalCrossentropy;
//!
//! // One row of two pixels, two classes
//! let probabilities = Tensor::new(&[0.5, 0.5, 0.25, 0.75], &[1, 1, 2, 2]).requires_grad();
//! let one_hot = Tensor::new(&[1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]);
//!
//! let criterion = CategoricalCrossentropy::new(DataFormat::ChannelsLast);
//! let loss = criterion.forward(&probabilities, &one_hot)?;
//! let expected = -(0.5f32.ln() + 0.75f32.ln()) / 2.0;
//! assert!((loss.item() - expected).abs() < 1e-6);
//!
//! loss.backward();
//! assert!(get_grad(probabilities.id()).is_some());
//! # Ok::<(), fcn::FcnError>(())
//! ```
//!
//! # References
//!
//! - Bishop, C. M. (2006). Pattern Recognition and Machine Learning. Springer.

use std::sync::Arc;

use crate::autograd::grad_fn::split_axis;
use crate::autograd::{record, GradFn, Tensor};
use crate::config::DataFormat;
use crate::error::{FcnError, Result};

/// Channel axis of a batched 4-D image tensor.
pub(crate) fn channel_axis(format: DataFormat) -> usize {
    match format {
        DataFormat::ChannelsLast => 3,
        DataFormat::ChannelsFirst => 1,
    }
}

/// Per-pixel categorical cross-entropy over probability maps.
///
/// For every pixel the class scores are renormalised to sum to one,
/// clipped to `[ε, 1 - ε]`, and scored against the one-hot target:
///
/// ```text
/// L = mean_pixels( -Σ_c t_c · log(clip(p_c / Σ_k p_k)) )
/// ```
///
/// Clipped entries pass no gradient.
#[derive(Debug, Clone, Copy)]
pub struct CategoricalCrossentropy {
    axis: usize,
    epsilon: f32,
}

impl CategoricalCrossentropy {
    /// Cross-entropy over the channel axis of `format` with `ε = 1e-7`.
    #[must_use]
    pub fn new(format: DataFormat) -> Self {
        Self {
            axis: channel_axis(format),
            epsilon: 1e-7,
        }
    }

    /// Sets the clipping constant.
    #[must_use]
    pub fn epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Mean loss as a one-element tensor.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::ShapeMismatch`] if `pred` and `target` differ in
    /// shape or are not 4-D.
    pub fn forward(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        if pred.shape() != target.shape() {
            return Err(FcnError::shape("categorical crossentropy target", pred.shape(), target.shape()));
        }
        if pred.ndim() != 4 {
            return Err(FcnError::shape("categorical crossentropy", "4-D batch", pred.shape()));
        }

        let (outer, len, inner) = split_axis(pred.shape(), self.axis);
        let pixels = outer * inner;
        let (p, t) = (pred.data(), target.data());
        let (lo, hi) = (self.epsilon, 1.0 - self.epsilon);

        let mut total = 0.0f64;
        for o in 0..outer {
            for i in 0..inner {
                let at = |k: usize| (o * len + k) * inner + i;
                let sum: f32 = (0..len).map(|k| p[at(k)]).sum();
                for k in 0..len {
                    if t[at(k)] != 0.0 {
                        let q = (p[at(k)] / sum).clamp(lo, hi);
                        total -= f64::from(t[at(k)] * q.ln());
                    }
                }
            }
        }

        let mut loss = Tensor::new(&[(total / pixels as f64) as f32], &[1]);
        let (axis, epsilon) = (self.axis, self.epsilon);
        record(&mut loss, &[pred], |_| {
            Arc::new(CrossentropyBackward {
                pred: pred.detach(),
                target: target.detach(),
                axis,
                epsilon,
            })
        });
        Ok(loss)
    }
}

/// Fused gradient of normalisation, clipping, and log-likelihood.
///
/// With `q = p / s`, `d_c = ∂L/∂q_c = -t_c / (M q_c)` (zero where clipped),
/// the input gradient is `∂L/∂p_k = (d_k - Σ_c d_c q_c) / s`.
struct CrossentropyBackward {
    pred: Tensor,
    target: Tensor,
    axis: usize,
    epsilon: f32,
}

impl GradFn for CrossentropyBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let (outer, len, inner) = split_axis(self.pred.shape(), self.axis);
        let scale = grad_output.data()[0] / (outer * inner) as f32;
        let (p, t) = (self.pred.data(), self.target.data());
        let (lo, hi) = (self.epsilon, 1.0 - self.epsilon);

        let mut grad = Tensor::zeros(self.pred.shape());
        let g = grad.data_mut();
        let mut d = vec![0.0f32; len];
        let mut q = vec![0.0f32; len];
        for o in 0..outer {
            for i in 0..inner {
                let at = |k: usize| (o * len + k) * inner + i;
                let sum: f32 = (0..len).map(|k| p[at(k)]).sum();
                let mut dot = 0.0;
                for k in 0..len {
                    q[k] = p[at(k)] / sum;
                    d[k] = if q[k] > lo && q[k] < hi {
                        -scale * t[at(k)] / q[k]
                    } else {
                        0.0
                    };
                    dot += d[k] * q[k];
                }
                for k in 0..len {
                    g[at(k)] = (d[k] - dot) / sum;
                }
            }
        }
        vec![grad]
    }

    fn name(&self) -> &'static str {
        "CrossentropyBackward"
    }
}

/// Sum of `l2 · Σ w²` over the given kernels.
///
/// Differentiable with respect to every kernel that requires a gradient.
#[must_use]
pub fn l2_penalty<'a>(kernels: impl IntoIterator<Item = (&'a Tensor, f32)>) -> Option<Tensor> {
    kernels
        .into_iter()
        .filter(|(_, l2)| *l2 != 0.0)
        .map(|(w, l2)| w.mul(w).sum().mul_scalar(l2))
        .reduce(|acc, term| acc.add(&term))
}
