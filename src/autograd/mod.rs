//! Reverse-mode automatic differentiation for the layer stack.
//!
//! Define-by-run: every differentiable operation records a [`GradFn`] to a
//! thread-local tape during the forward pass, and [`Tensor::backward`]
//! replays the tape in reverse. Leaf tensors created with
//! [`Tensor::requires_grad`] receive their gradients in the tape, where
//! optimizers read them through [`get_grad`].
//!
//! ```
//! use fcn::autograd::{get_grad, Tensor};
//!
//! let w = Tensor::from_slice(&[0.5, 0.5]).requires_grad();
//! let x = Tensor::from_slice(&[1.0, 2.0]);
//! let y = x.mul(&w).sum();
//! y.backward();
//! assert_eq!(get_grad(w.id()).unwrap().data(), &[1.0, 2.0]);
//! ```

pub(crate) mod grad_fn;
mod graph;
mod ops;
mod tensor;

pub use grad_fn::GradFn;
pub use graph::ComputationGraph;
pub use tensor::{Tensor, TensorId};

use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    /// Computation graph for the current thread.
    static GRAPH: RefCell<ComputationGraph> = RefCell::new(ComputationGraph::new());

    /// Flag to disable gradient tracking (for inference).
    static GRAD_ENABLED: RefCell<bool> = const { RefCell::new(true) };
}

/// Execute a closure without gradient tracking.
pub fn no_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    GRAD_ENABLED.with(|enabled| {
        let prev = *enabled.borrow();
        *enabled.borrow_mut() = false;
        let result = f();
        *enabled.borrow_mut() = prev;
        result
    })
}

/// Check if gradient tracking is currently enabled.
#[must_use]
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|enabled| *enabled.borrow())
}

pub(crate) fn with_graph<F, R>(f: F) -> R
where
    F: FnOnce(&mut ComputationGraph) -> R,
{
    GRAPH.with(|graph| f(&mut graph.borrow_mut()))
}

/// Clear the computation graph (called after each optimisation step).
pub fn clear_graph() {
    GRAPH.with(|graph| graph.borrow_mut().clear());
}

/// Get gradient for a tensor by ID from the graph.
#[must_use]
pub fn get_grad(id: TensorId) -> Option<Tensor> {
    with_graph(|graph| graph.get_grad(id))
}

/// Clear gradient for a specific tensor by ID.
pub fn clear_grad(id: TensorId) {
    with_graph(|graph| graph.clear_grad(id));
}

/// Records the operation that produced `result` when any input
/// participates in gradient computation.
///
/// `make_grad_fn` receives the forward result and only runs when the
/// operation is actually recorded, so saved activations are never copied
/// during inference. Used by every differentiable kernel, including the
/// spatial ones in [`crate::nn`].
pub(crate) fn record<F>(result: &mut Tensor, inputs: &[&Tensor], make_grad_fn: F)
where
    F: FnOnce(&Tensor) -> Arc<dyn GradFn>,
{
    if !is_grad_enabled() || !inputs.iter().any(|t| t.requires_grad_enabled()) {
        return;
    }
    let grad_fn = make_grad_fn(result);
    result.requires_grad_(true);
    result.set_grad_fn(grad_fn.clone());
    with_graph(|graph| {
        for input in inputs {
            graph.register_tensor(input);
        }
        graph.record(result.id(), grad_fn, inputs.iter().map(|t| t.id()).collect());
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_grad_context() {
        assert!(is_grad_enabled());

        no_grad(|| {
            assert!(!is_grad_enabled());
        });

        assert!(is_grad_enabled());
    }

    #[test]
    fn test_nested_no_grad() {
        no_grad(|| {
            no_grad(|| {
                assert!(!is_grad_enabled());
            });
            assert!(!is_grad_enabled());
        });

        assert!(is_grad_enabled());
    }

    #[test]
    fn test_no_grad_skips_recording() {
        clear_graph();
        let x = Tensor::from_slice(&[1.0, 2.0]).requires_grad();
        let y = no_grad(|| x.mul_scalar(3.0));
        assert!(!y.requires_grad_enabled());
        assert!(with_graph(|g| g.is_empty()));
    }
}
