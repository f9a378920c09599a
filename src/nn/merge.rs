//! Layers combining or rescaling feature maps.

use super::layer::{BuildContext, Layer};
use crate::autograd::Tensor;
use crate::error::{FcnError, Result};

/// Element-wise sum of two or more inputs of identical shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct Add;

impl Add {
    /// Creates the layer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Layer for Add {
    fn kind(&self) -> &'static str {
        "add"
    }

    fn build(&mut self, input_shapes: &[&[usize]], _ctx: &mut BuildContext) -> Result<Vec<usize>> {
        let [first, rest @ ..] = input_shapes else {
            return Err(FcnError::InvalidArchitecture("add needs at least two inputs".into()));
        };
        if rest.is_empty() {
            return Err(FcnError::InvalidArchitecture("add needs at least two inputs".into()));
        }
        if let Some(other) = rest.iter().find(|s| *s != first) {
            return Err(FcnError::shape("add", first, other));
        }
        Ok(first.to_vec())
    }

    fn forward(&self, inputs: &[&Tensor], _training: bool) -> Result<Tensor> {
        let (first, rest) = inputs
            .split_first()
            .ok_or_else(|| FcnError::InvalidArchitecture("add called without inputs".into()))?;
        let mut sum = (*first).clone();
        for x in rest {
            if x.shape() != sum.shape() {
                return Err(FcnError::shape("add", sum.shape(), x.shape()));
            }
            sum = sum.add(x);
        }
        Ok(sum)
    }
}

/// Multiplies its input by a constant.
///
/// Used to weight skip connections before they are summed, so features
/// from shallower layers enter at a smaller magnitude.
#[derive(Debug, Clone, Copy)]
pub struct Scale {
    factor: f32,
}

impl Scale {
    /// Scaling by `factor`.
    #[must_use]
    pub fn new(factor: f32) -> Self {
        Self { factor }
    }

    /// The multiplier.
    #[must_use]
    pub fn factor(&self) -> f32 {
        self.factor
    }
}

impl Layer for Scale {
    fn kind(&self) -> &'static str {
        "lambda"
    }

    fn build(&mut self, input_shapes: &[&[usize]], _ctx: &mut BuildContext) -> Result<Vec<usize>> {
        super::layer::single_input(input_shapes, self.kind()).map(<[usize]>::to_vec)
    }

    fn forward(&self, inputs: &[&Tensor], _training: bool) -> Result<Tensor> {
        Ok(inputs[0].mul_scalar(self.factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::{clear_graph, get_grad};
    use crate::config::DataFormat;

    fn ctx() -> BuildContext {
        BuildContext::new(DataFormat::ChannelsLast, None)
    }

    #[test]
    fn test_add_validates_shapes() {
        let mut add = Add::new();
        assert_eq!(add.build(&[&[4, 4, 2], &[4, 4, 2]], &mut ctx()).expect("build"), vec![4, 4, 2]);
        assert!(matches!(
            add.build(&[&[4, 4, 2], &[4, 5, 2]], &mut ctx()),
            Err(FcnError::ShapeMismatch { .. })
        ));
        assert!(add.build(&[&[4, 4, 2]], &mut ctx()).is_err());
    }

    #[test]
    fn test_add_sums_three_inputs() {
        let a = Tensor::new(&[1.0, 2.0], &[1, 1, 1, 2]);
        let b = Tensor::new(&[10.0, 20.0], &[1, 1, 1, 2]);
        let y = Add::new().forward(&[&a, &b, &a], false).expect("forward");
        assert_eq!(y.data(), &[12.0, 24.0]);
    }

    #[test]
    fn test_scale_gradient() {
        clear_graph();
        let mut scale = Scale::new(1e-2);
        scale.build(&[&[1, 1, 3]], &mut ctx()).expect("build");
        let x = Tensor::new(&[1.0, -2.0, 3.0], &[1, 1, 1, 3]).requires_grad();
        let y = scale.forward(&[&x], false).expect("forward");
        assert!((y.data()[2] - 0.03).abs() < 1e-7);
        y.sum().backward();
        assert!(get_grad(x.id())
            .expect("grad")
            .data()
            .iter()
            .all(|g| (g - 1e-2).abs() < 1e-9));
    }
}
