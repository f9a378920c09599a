//! Dropout regularization.
//!
//! Dropout randomly zeroes elements during training to prevent co-adaptation
//! of neurons and reduce overfitting.
//!
//! # Reference
//!
//! - Srivastava, N., et al. (2014). Dropout: A simple way to prevent neural
//!   networks from overfitting. JMLR.

use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::layer::{single_input, BuildContext, Layer};
use crate::autograd::Tensor;
use crate::error::{FcnError, Result};

/// Dropout regularization layer.
///
/// During training, randomly zeroes elements with probability `rate` and
/// scales the survivors by `1/(1-rate)` (inverted dropout). Outside training
/// the input passes through unchanged.
///
/// # Example
///
/// ```
/// use fcn::config::BackendConfig;
/// use fcn::nn::{Dropout, Graph};
///
/// let mut graph = Graph::new(BackendConfig::default());
/// let fc6 = graph.input(&[4, 4, 8])?;
/// let x = graph.apply(Dropout::new(0.5)?, &[&fc6])?;
/// assert_eq!(x.shape(), &[4, 4, 8]);
/// assert!(graph.contains("dropout_1"));
/// # Ok::<(), fcn::FcnError>(())
/// ```
pub struct Dropout {
    /// Probability of an element being zeroed
    rate: f32,

    /// Random number generator (Mutex for thread safety)
    rng: Mutex<StdRng>,
}

impl Dropout {
    /// Create a new Dropout layer.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::InvalidArchitecture`] unless `rate` is in `[0, 1)`.
    pub fn new(rate: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(FcnError::InvalidArchitecture(format!(
                "dropout rate must be in [0, 1), got {rate}"
            )));
        }
        Ok(Self {
            rate,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Get the dropout probability.
    #[must_use]
    pub fn rate(&self) -> f32 {
        self.rate
    }
}

impl Layer for Dropout {
    fn kind(&self) -> &'static str {
        "dropout"
    }

    fn build(&mut self, input_shapes: &[&[usize]], ctx: &mut BuildContext) -> Result<Vec<usize>> {
        let shape = single_input(input_shapes, self.kind())?;
        if let Some(seed) = ctx.next_seed() {
            self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        }
        Ok(shape.to_vec())
    }

    fn forward(&self, inputs: &[&Tensor], training: bool) -> Result<Tensor> {
        let x = inputs[0];
        if !training || self.rate == 0.0 {
            return Ok(x.clone());
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let scale = 1.0 / (1.0 - self.rate);
        let mask: Vec<f32> = (0..x.numel())
            .map(|_| if rng.gen::<f32>() < self.rate { 0.0 } else { scale })
            .collect();

        Ok(x.mul(&Tensor::from_vec(mask, x.shape())))
    }
}

impl std::fmt::Debug for Dropout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dropout")
            .field("rate", &self.rate)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{clear_graph, get_grad};
    use crate::config::DataFormat;

    fn built(rate: f32, seed: Option<u64>) -> Dropout {
        let mut dropout = Dropout::new(rate).expect("rate");
        let mut ctx = BuildContext::new(DataFormat::ChannelsLast, seed);
        dropout.build(&[&[4, 4, 8]], &mut ctx).expect("build");
        dropout
    }

    #[test]
    fn test_rejects_invalid_rate() {
        assert!(Dropout::new(1.0).is_err());
        assert!(Dropout::new(-0.1).is_err());
    }

    #[test]
    fn test_identity_outside_training() {
        let dropout = built(0.5, Some(1));
        let x = Tensor::ones(&[2, 4, 4, 8]);
        let y = dropout.forward(&[&x], false).expect("forward");
        assert_eq!(y.data(), x.data());
    }

    #[test]
    fn test_training_zeroes_and_rescales() {
        let dropout = built(0.5, Some(1));
        let x = Tensor::ones(&[2, 4, 4, 8]);
        let y = dropout.forward(&[&x], true).expect("forward");

        assert!(y.data().iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        let zeros = y.data().iter().filter(|&&v| v == 0.0).count();
        assert!(zeros > 64 && zeros < 192, "{zeros} of 256 dropped");
    }

    #[test]
    fn test_seeded_masks_repeat() {
        let x = Tensor::ones(&[1, 4, 4, 8]);
        let a = built(0.5, Some(9)).forward(&[&x], true).expect("forward");
        let b = built(0.5, Some(9)).forward(&[&x], true).expect("forward");
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_gradient_follows_mask() {
        clear_graph();
        let dropout = built(0.5, Some(4));
        let x = Tensor::ones(&[1, 4, 4, 8]).requires_grad();
        let y = dropout.forward(&[&x], true).expect("forward");
        let mask = y.data().to_vec();
        y.sum().backward();
        assert_eq!(get_grad(x.id()).expect("grad").data(), mask.as_slice());
    }
}
