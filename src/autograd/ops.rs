//! Differentiable operations for tensors.
//!
//! Each operation:
//! 1. Computes the forward result
//! 2. Records a `GradFn` to the computation graph (if gradient tracking is enabled)

use std::sync::Arc;

use super::grad_fn::{
    split_axis, AddBackward, MeanBackward, MulBackward, MulScalarBackward, NegBackward,
    ReluBackward, SoftmaxBackward, SumBackward,
};
use super::record;
use super::tensor::Tensor;

// ============================================================================
// Element-wise Operations
// ============================================================================

impl Tensor {
    /// Element-wise addition: z = self + other
    ///
    /// # Panics
    ///
    /// Panics if the shapes differ.
    #[must_use]
    pub fn add(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape(), other.shape(), "add requires equal shapes");
        let data = self
            .data()
            .iter()
            .zip(other.data())
            .map(|(&a, &b)| a + b)
            .collect();

        let mut result = Tensor::from_vec(data, self.shape());
        record(&mut result, &[self, other], |_| Arc::new(AddBackward));
        result
    }

    /// Element-wise multiplication: z = self * other
    ///
    /// # Panics
    ///
    /// Panics if the shapes differ.
    #[must_use]
    pub fn mul(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape(), other.shape(), "mul requires equal shapes");
        let data = self
            .data()
            .iter()
            .zip(other.data())
            .map(|(&a, &b)| a * b)
            .collect();

        let mut result = Tensor::from_vec(data, self.shape());
        record(&mut result, &[self, other], |_| {
            Arc::new(MulBackward {
                x: self.detach(),
                y: other.detach(),
            })
        });
        result
    }

    /// Negation: z = -self
    #[must_use]
    pub fn neg(&self) -> Tensor {
        let data = self.data().iter().map(|&a| -a).collect();
        let mut result = Tensor::from_vec(data, self.shape());
        record(&mut result, &[self], |_| Arc::new(NegBackward));
        result
    }

    /// Scalar multiplication: z = self * scalar
    #[must_use]
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let data = self.data().iter().map(|&a| a * scalar).collect();
        let mut result = Tensor::from_vec(data, self.shape());
        record(&mut result, &[self], |_| Arc::new(MulScalarBackward { scalar }));
        result
    }
}

// ============================================================================
// Reduction Operations
// ============================================================================

impl Tensor {
    /// Sum all elements: z = sum(self)
    #[must_use]
    pub fn sum(&self) -> Tensor {
        let sum: f32 = self.data().iter().sum();
        let mut result = Tensor::new(&[sum], &[1]);
        record(&mut result, &[self], |_| {
            Arc::new(SumBackward {
                input_shape: self.shape().to_vec(),
            })
        });
        result
    }

    /// Mean of all elements: z = mean(self)
    #[must_use]
    pub fn mean(&self) -> Tensor {
        let sum: f32 = self.data().iter().sum();
        let mean = sum / self.numel() as f32;
        let mut result = Tensor::new(&[mean], &[1]);
        record(&mut result, &[self], |_| {
            Arc::new(MeanBackward {
                input_shape: self.shape().to_vec(),
            })
        });
        result
    }
}

// ============================================================================
// Activation Functions
// ============================================================================

impl Tensor {
    /// `ReLU` activation: z = max(0, self)
    #[must_use]
    pub fn relu(&self) -> Tensor {
        let data = self.data().iter().map(|&a| a.max(0.0)).collect();
        let mut result = Tensor::from_vec(data, self.shape());
        record(&mut result, &[self], |out| {
            Arc::new(ReluBackward {
                output: out.detach(),
            })
        });
        result
    }

    /// Softmax along `axis`.
    ///
    /// softmax(x)_i = `exp(x_i - max)` / `Σ_j` `exp(x_j - max)`
    ///
    /// # Panics
    ///
    /// Panics if `axis` is out of range.
    #[must_use]
    pub fn softmax_axis(&self, axis: usize) -> Tensor {
        assert!(axis < self.ndim(), "softmax axis {axis} out of range");
        let (outer, len, inner) = split_axis(self.shape(), axis);
        let x = self.data();
        let mut out = vec![0.0; x.len()];

        for o in 0..outer {
            for i in 0..inner {
                let at = |k: usize| (o * len + k) * inner + i;
                let max_val = (0..len).map(|k| x[at(k)]).fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for k in 0..len {
                    let e = (x[at(k)] - max_val).exp();
                    out[at(k)] = e;
                    sum += e;
                }
                for k in 0..len {
                    out[at(k)] /= sum;
                }
            }
        }

        let mut result = Tensor::from_vec(out, self.shape());
        record(&mut result, &[self], |out| {
            Arc::new(SoftmaxBackward {
                output: out.detach(),
                axis,
            })
        });
        result
    }
}
