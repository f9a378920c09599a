//! Gradient function trait and element-wise implementations.
//!
//! Each differentiable operation implements `GradFn` to define how
//! gradients flow backward through it. Spatial kernels (convolution,
//! pooling, cropping, resizing) keep their grad functions next to their
//! forward passes in [`crate::nn`].

use super::tensor::Tensor;

/// Trait for functions that compute gradients during backward pass.
///
/// Each differentiable operation creates a `GradFn` implementation
/// that captures the necessary context for gradient computation.
///
/// For element-wise addition z = x + y:
/// - ∂z/∂x = 1
/// - ∂z/∂y = 1
///
/// So `backward(grad_output)` returns [`grad_output`, `grad_output`].
pub trait GradFn: Send + Sync {
    /// Compute gradients with respect to inputs.
    ///
    /// Returns one gradient per input tensor, in the order the inputs were
    /// recorded during the forward pass.
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor>;

    /// Human-readable name for debugging.
    fn name(&self) -> &'static str;
}

fn map(grad_output: &Tensor, f: impl Fn(f32) -> f32) -> Tensor {
    Tensor::from_vec(
        grad_output.data().iter().map(|&g| f(g)).collect(),
        grad_output.shape(),
    )
}

fn zip_map(grad_output: &Tensor, other: &Tensor, f: impl Fn(f32, f32) -> f32) -> Tensor {
    Tensor::from_vec(
        grad_output
            .data()
            .iter()
            .zip(other.data())
            .map(|(&g, &o)| f(g, o))
            .collect(),
        grad_output.shape(),
    )
}

/// Gradient function for negation: z = -x
pub(crate) struct NegBackward;

impl GradFn for NegBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        vec![map(grad_output, |g| -g)]
    }

    fn name(&self) -> &'static str {
        "NegBackward"
    }
}

/// Gradient function for addition of equally shaped tensors: z = x + y
pub(crate) struct AddBackward;

impl GradFn for AddBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        vec![grad_output.clone(), grad_output.clone()]
    }

    fn name(&self) -> &'static str {
        "AddBackward"
    }
}

/// Gradient function for multiplication: z = x * y
pub(crate) struct MulBackward {
    pub(crate) x: Tensor,
    pub(crate) y: Tensor,
}

impl GradFn for MulBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        // ∂(x*y)/∂x = y, ∂(x*y)/∂y = x
        vec![
            zip_map(grad_output, &self.y, |g, y| g * y),
            zip_map(grad_output, &self.x, |g, x| g * x),
        ]
    }

    fn name(&self) -> &'static str {
        "MulBackward"
    }
}

/// Gradient function for scalar multiplication: z = x * c
pub(crate) struct MulScalarBackward {
    pub(crate) scalar: f32,
}

impl GradFn for MulScalarBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let scalar = self.scalar;
        vec![map(grad_output, |g| g * scalar)]
    }

    fn name(&self) -> &'static str {
        "MulScalarBackward"
    }
}

/// Gradient function for sum: z = sum(x)
pub(crate) struct SumBackward {
    pub(crate) input_shape: Vec<usize>,
}

impl GradFn for SumBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let len: usize = self.input_shape.iter().product();
        vec![Tensor::from_vec(
            vec![grad_output.item(); len],
            &self.input_shape,
        )]
    }

    fn name(&self) -> &'static str {
        "SumBackward"
    }
}

/// Gradient function for mean: z = mean(x)
pub(crate) struct MeanBackward {
    pub(crate) input_shape: Vec<usize>,
}

impl GradFn for MeanBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let len: usize = self.input_shape.iter().product();
        let g = grad_output.item() / len as f32;
        vec![Tensor::from_vec(vec![g; len], &self.input_shape)]
    }

    fn name(&self) -> &'static str {
        "MeanBackward"
    }
}

/// Gradient function for `ReLU`: z = max(0, x)
pub(crate) struct ReluBackward {
    pub(crate) output: Tensor,
}

impl GradFn for ReluBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        vec![zip_map(grad_output, &self.output, |g, y| {
            if y > 0.0 {
                g
            } else {
                0.0
            }
        })]
    }

    fn name(&self) -> &'static str {
        "ReluBackward"
    }
}

/// Gradient function for softmax along one axis.
///
/// For each slice: ∂L/∂x_i = y_i (g_i - Σ_j g_j y_j)
pub(crate) struct SoftmaxBackward {
    pub(crate) output: Tensor,
    pub(crate) axis: usize,
}

impl GradFn for SoftmaxBackward {
    fn backward(&self, grad_output: &Tensor) -> Vec<Tensor> {
        let shape = self.output.shape();
        let (outer, len, inner) = split_axis(shape, self.axis);
        let y = self.output.data();
        let g = grad_output.data();
        let mut grad = vec![0.0; y.len()];

        for o in 0..outer {
            for i in 0..inner {
                let at = |k: usize| (o * len + k) * inner + i;
                let dot: f32 = (0..len).map(|k| g[at(k)] * y[at(k)]).sum();
                for k in 0..len {
                    grad[at(k)] = y[at(k)] * (g[at(k)] - dot);
                }
            }
        }

        vec![Tensor::from_vec(grad, shape)]
    }

    fn name(&self) -> &'static str {
        "SoftmaxBackward"
    }
}

/// Splits `shape` around `axis` into `(outer, axis_len, inner)` element counts.
pub(crate) fn split_axis(shape: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    (outer, shape[axis], inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_backward_swaps_operands() {
        let grad_fn = MulBackward {
            x: Tensor::from_slice(&[2.0, 3.0]),
            y: Tensor::from_slice(&[5.0, 7.0]),
        };
        let grads = grad_fn.backward(&Tensor::ones(&[2]));
        assert_eq!(grads[0].data(), &[5.0, 7.0]);
        assert_eq!(grads[1].data(), &[2.0, 3.0]);
    }

    #[test]
    fn test_mean_backward_spreads_evenly() {
        let grad_fn = MeanBackward {
            input_shape: vec![2, 2],
        };
        let grads = grad_fn.backward(&Tensor::from_slice(&[1.0]));
        assert_eq!(grads[0].data(), &[0.25; 4]);
    }

    #[test]
    fn test_relu_backward_masks_inactive() {
        let grad_fn = ReluBackward {
            output: Tensor::from_slice(&[0.0, 2.0, 0.0]),
        };
        let grads = grad_fn.backward(&Tensor::from_slice(&[1.0, 1.0, 1.0]));
        assert_eq!(grads[0].data(), &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_softmax_backward_sums_to_zero() {
        // Softmax outputs lie on the simplex, so input gradients sum to zero
        let grad_fn = SoftmaxBackward {
            output: Tensor::new(&[0.2, 0.3, 0.5], &[1, 3]),
            axis: 1,
        };
        let grads = grad_fn.backward(&Tensor::new(&[1.0, -2.0, 0.5], &[1, 3]));
        let total: f32 = grads[0].data().iter().sum();
        assert!(total.abs() < 1e-6);
    }

    #[test]
    fn test_split_axis() {
        assert_eq!(split_axis(&[2, 3, 4, 5], 3), (24, 5, 1));
        assert_eq!(split_axis(&[2, 3, 4, 5], 1), (2, 3, 20));
    }
}
