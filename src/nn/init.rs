//! Weight initialization functions.
//!
//! - Glorot uniform (Glorot & Bengio, 2010): default for transposed convolutions
//! - He normal (He et al., 2015): used by every `ReLU` convolution in the FCN blocks
//!
//! # References
//!
//! - Glorot, X., & Bengio, Y. (2010). Understanding the difficulty of training
//!   deep feedforward neural networks. AISTATS.
//! - He, K., et al. (2015). Delving deep into rectifiers: Surpassing human-level
//!   performance on `ImageNet` classification. ICCV.

use crate::autograd::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Standard deviation of a unit normal truncated to `[-2, 2]`.
const TRUNCATED_NORMAL_STD: f32 = 0.879_625_66;

/// Fan-in and fan-out of a weight shape.
///
/// Convolution kernels are laid out `(kh, kw, a, b)`: the receptive field
/// `kh * kw` multiplies the second-to-last (`fan_in`) and last (`fan_out`)
/// dimensions. 1-D shapes use their length for both.
#[must_use]
pub fn fans(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (*n, *n),
        [a, b] => (*a, *b),
        [spatial @ .., a, b] => {
            let receptive: usize = spatial.iter().product();
            (a * receptive, b * receptive)
        }
    }
}

/// He normal initialization (He et al., 2015).
///
/// Samples a normal truncated at two standard deviations, rescaled so the
/// final standard deviation is `sqrt(2 / fan_in)`.
///
/// # Arguments
///
/// * `shape` - Shape of the tensor
/// * `fan_in` - Number of input connections per output unit
/// * `seed` - Optional random seed
#[must_use]
pub fn he_normal(shape: &[usize], fan_in: usize, seed: Option<u64>) -> Tensor {
    let std = (2.0 / fan_in.max(1) as f32).sqrt() / TRUNCATED_NORMAL_STD;
    truncated_normal(shape, 0.0, std, seed)
}

/// Glorot uniform initialization (Glorot & Bengio, 2010).
///
/// Samples from U(-a, a) where a = sqrt(6 / (`fan_in` + `fan_out`)).
#[must_use]
pub fn glorot_uniform(shape: &[usize], fan_in: usize, fan_out: usize, seed: Option<u64>) -> Tensor {
    let a = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    uniform(shape, -a, a, seed)
}

fn rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

/// Uniform distribution initialization.
///
/// Samples from U(low, high).
pub(crate) fn uniform(shape: &[usize], low: f32, high: f32, seed: Option<u64>) -> Tensor {
    let numel: usize = shape.iter().product();
    let mut rng = rng(seed);
    let data = (0..numel).map(|_| rng.gen_range(low..high)).collect();
    Tensor::from_vec(data, shape)
}

/// Normal distribution truncated to `mean ± 2 std` (resampling outliers).
pub(crate) fn truncated_normal(shape: &[usize], mean: f32, std: f32, seed: Option<u64>) -> Tensor {
    let numel: usize = shape.iter().product();
    let mut rng = rng(seed);

    // Box-Muller transform, rejecting samples beyond two sigmas
    let data = (0..numel)
        .map(|_| loop {
            let u1: f32 = rng.gen_range(0.0001_f32..1.0_f32);
            let u2: f32 = rng.gen_range(0.0_f32..1.0_f32);
            let z = (-2.0_f32 * u1.ln()).sqrt() * (2.0_f32 * std::f32::consts::PI * u2).cos();
            if z.abs() <= 2.0 {
                break mean + std * z;
            }
        })
        .collect();

    Tensor::from_vec(data, shape)
}

/// Zeros initialization.
pub(crate) fn zeros(shape: &[usize]) -> Tensor {
    Tensor::zeros(shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fans_of_conv_kernel() {
        assert_eq!(fans(&[3, 3, 64, 128]), (576, 1152));
        assert_eq!(fans(&[7, 7, 512, 4096]), (7 * 7 * 512, 7 * 7 * 4096));
        assert_eq!(fans(&[21]), (21, 21));
    }

    #[test]
    fn test_he_normal_is_truncated_and_scaled() {
        let fan_in = 3 * 3 * 16;
        let t = he_normal(&[3, 3, 16, 32], fan_in, Some(42));
        let target = (2.0 / fan_in as f32).sqrt();
        let bound = 2.0 * target / TRUNCATED_NORMAL_STD;
        assert!(t.data().iter().all(|v| v.abs() <= bound + 1e-6));

        let n = t.numel() as f32;
        let mean = t.data().iter().sum::<f32>() / n;
        let std = (t.data().iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n).sqrt();
        assert!(mean.abs() < 0.02, "mean {mean}");
        assert!((std - target).abs() < 0.1 * target, "std {std} vs {target}");
    }

    #[test]
    fn test_glorot_uniform_bounds() {
        let t = glorot_uniform(&[4, 4, 21, 21], 336, 336, Some(42));
        let a = (6.0 / 672.0_f32).sqrt();
        for &val in t.data() {
            assert!((-a..=a).contains(&val), "Value {val} out of bounds");
        }
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        let t1 = he_normal(&[10, 10], 10, Some(42));
        let t2 = he_normal(&[10, 10], 10, Some(42));
        assert_eq!(t1.data(), t2.data());
    }

    #[test]
    fn test_unseeded_init_differs() {
        let t1 = uniform(&[100], 0.0, 1.0, None);
        let t2 = uniform(&[100], 0.0, 1.0, None);
        assert_ne!(t1.data(), t2.data());
    }
}
