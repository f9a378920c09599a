//! Gradient-based optimizers for segmentation training.
//!
//! Optimizers read the gradients that [`Tensor::backward`] left on the
//! autograd tape and update parameter values in place. Per-parameter state
//! is keyed by [`TensorId`], which stays stable for the lifetime of a
//! parameter because updates never replace the tensor.
//!
//! # Example
//!
//! ```
//! use fcn::autograd::Tensor;
//! use fcn::nn::optim::{Optimizer, SGD};
//!
//! let mut w = Tensor::from_slice(&[1.0, -1.0]).requires_grad();
//! w.mul(&w).sum().backward();
//!
//! let mut sgd = SGD::new(0.25);
//! sgd.step_with_params(&mut [&mut w]);
//! assert_eq!(w.data(), &[0.5, -0.5]);
//! ```
//!
//! # References
//!
//! - Robbins, H., & Monro, S. (1951). A stochastic approximation method.
//! - Tieleman, T., & Hinton, G. (2012). Lecture 6.5 - RMSProp. COURSERA.

use std::collections::HashMap;

use crate::autograd::{get_grad, Tensor, TensorId};

/// Common trait for all optimizers.
pub trait Optimizer: Send {
    /// Applies one update to every parameter that received a gradient.
    fn step_with_params(&mut self, params: &mut [&mut Tensor]);

    /// Get current learning rate.
    fn lr(&self) -> f32;

    /// Set learning rate (for schedules).
    fn set_lr(&mut self, lr: f32);
}

/// Stochastic Gradient Descent optimizer with momentum.
///
/// Update rule:
/// ```text
/// v_t = momentum * v_{t-1} - lr * grad
/// param = param + v_t
/// ```
#[derive(Debug)]
pub struct SGD {
    /// Learning rate
    lr: f32,
    /// Momentum factor (0 = no momentum)
    momentum: f32,
    /// Velocity buffers for momentum
    velocities: HashMap<TensorId, Vec<f32>>,
}

impl SGD {
    /// Create a new SGD optimizer without momentum.
    #[must_use]
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            momentum: 0.0,
            velocities: HashMap::new(),
        }
    }

    /// Create SGD with momentum.
    #[must_use]
    pub fn with_momentum(lr: f32, momentum: f32) -> Self {
        Self {
            momentum,
            ..Self::new(lr)
        }
    }

    fn update_param(&mut self, param: &mut Tensor) {
        let Some(grad) = get_grad(param.id()) else {
            return; // Frozen or unused
        };
        let grad_data = grad.data();

        if self.momentum == 0.0 {
            for (p, g) in param.data_mut().iter_mut().zip(grad_data) {
                *p -= self.lr * g;
            }
            return;
        }

        let velocity = self
            .velocities
            .entry(param.id())
            .or_insert_with(|| vec![0.0; grad_data.len()]);
        for ((p, v), g) in param.data_mut().iter_mut().zip(velocity.iter_mut()).zip(grad_data) {
            *v = self.momentum * *v - self.lr * g;
            *p += *v;
        }
    }
}

impl Optimizer for SGD {
    fn step_with_params(&mut self, params: &mut [&mut Tensor]) {
        for param in params.iter_mut() {
            self.update_param(param);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}

/// `RMSprop` optimizer.
///
/// Maintains a moving average of squared gradients for adaptive learning rates.
///
/// Update rule:
/// ```text
/// v_t = ρ * v_{t-1} + (1 - ρ) * grad²
/// param = param - lr * grad / (√v_t + ε)
/// ```
///
/// Defaults: ρ=0.9, ε=1e-7.
#[derive(Debug)]
pub struct RMSprop {
    lr: f32,
    rho: f32,
    eps: f32,
    /// Running average of squared gradients
    v: HashMap<TensorId, Vec<f32>>,
}

impl RMSprop {
    /// Create a new `RMSprop` optimizer.
    #[must_use]
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            rho: 0.9,
            eps: 1e-7,
            v: HashMap::new(),
        }
    }

    /// Set the decay of the squared-gradient average.
    #[must_use]
    pub fn rho(mut self, rho: f32) -> Self {
        self.rho = rho;
        self
    }

    /// Set epsilon for numerical stability.
    #[must_use]
    pub fn eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    fn update_param(&mut self, param: &mut Tensor) {
        let Some(grad) = get_grad(param.id()) else {
            return;
        };
        let grad_data = grad.data();
        let v = self
            .v
            .entry(param.id())
            .or_insert_with(|| vec![0.0; grad_data.len()]);

        for ((p, v), &g) in param.data_mut().iter_mut().zip(v.iter_mut()).zip(grad_data) {
            *v = self.rho * *v + (1.0 - self.rho) * g * g;
            *p -= self.lr * g / (v.sqrt() + self.eps);
        }
    }
}

impl Default for RMSprop {
    fn default() -> Self {
        Self::new(1e-3)
    }
}

impl Optimizer for RMSprop {
    fn step_with_params(&mut self, params: &mut [&mut Tensor]) {
        for param in params.iter_mut() {
            self.update_param(param);
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }
}
