//! Computation graph for automatic differentiation.
//!
//! Operations are recorded on a tape during the forward pass and replayed
//! in reverse by [`ComputationGraph::backward`].

use std::collections::HashMap;
use std::sync::Arc;

use super::grad_fn::GradFn;
use super::tensor::{Tensor, TensorId};

/// Entry in the computation tape.
#[derive(Clone)]
pub(crate) struct TapeEntry {
    /// ID of the output tensor
    pub output_id: TensorId,

    /// Function to compute gradients
    pub grad_fn: Arc<dyn GradFn>,

    /// IDs of input tensors
    pub input_ids: Vec<TensorId>,
}

/// Tape of recorded operations plus the gradients of trainable leaves.
///
/// Leaves are tracked by id only; intermediate activations live in the
/// grad functions that need them and are dropped with the tape.
///
/// # Thread Safety
///
/// Each thread has its own computation graph (via `thread_local` storage
/// in the parent module).
#[allow(missing_debug_implementations)]
pub struct ComputationGraph {
    tape: Vec<TapeEntry>,
    leaves: HashMap<TensorId, Option<Tensor>>,
}

impl ComputationGraph {
    /// Create a new empty computation graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tape: Vec::new(),
            leaves: HashMap::new(),
        }
    }

    /// Clear all recorded operations and accumulated gradients.
    pub fn clear(&mut self) {
        self.tape.clear();
        self.leaves.clear();
    }

    /// Register a tensor as a gradient sink if it is a trainable leaf.
    pub fn register_tensor(&mut self, tensor: &Tensor) {
        if tensor.requires_grad_enabled() && tensor.is_leaf() {
            self.leaves.entry(tensor.id()).or_insert(None);
        }
    }

    /// Record an operation to the tape.
    pub fn record(
        &mut self,
        output_id: TensorId,
        grad_fn: Arc<dyn GradFn>,
        input_ids: Vec<TensorId>,
    ) {
        self.tape.push(TapeEntry {
            output_id,
            grad_fn,
            input_ids,
        });
    }

    /// Compute gradients via backpropagation.
    ///
    /// Walks the tape in reverse, handing each recorded operation the
    /// gradient of its output and accumulating the returned input gradients.
    /// Gradients reaching registered leaves are stored on them.
    pub fn backward(&mut self, output_id: TensorId, grad_output: Tensor) {
        let mut grads: HashMap<TensorId, Tensor> = HashMap::new();
        grads.insert(output_id, grad_output);

        for entry in self.tape.iter().rev() {
            // Outputs are consumed exactly once in reverse order
            let Some(grad_out) = grads.remove(&entry.output_id) else {
                continue;
            };

            let input_grads = entry.grad_fn.backward(&grad_out);
            for (input_id, input_grad) in entry.input_ids.iter().zip(input_grads) {
                match grads.get_mut(input_id) {
                    Some(existing) => {
                        for (a, b) in existing.data_mut().iter_mut().zip(input_grad.data()) {
                            *a += b;
                        }
                    }
                    None => {
                        grads.insert(*input_id, input_grad);
                    }
                }
            }
        }

        for (id, grad) in grads {
            if let Some(slot) = self.leaves.get_mut(&id) {
                match slot {
                    Some(existing) => {
                        for (a, b) in existing.data_mut().iter_mut().zip(grad.data()) {
                            *a += b;
                        }
                    }
                    None => *slot = Some(grad),
                }
            }
        }
    }

    /// Get the number of recorded operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tape.len()
    }

    /// Check if the tape is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tape.is_empty()
    }

    /// Get gradient for a tensor by ID (after backward).
    #[must_use]
    pub fn get_grad(&self, id: TensorId) -> Option<Tensor> {
        self.leaves.get(&id).and_then(Clone::clone)
    }

    /// Clear gradient for a specific tensor.
    pub fn clear_grad(&mut self, id: TensorId) {
        if let Some(slot) = self.leaves.get_mut(&id) {
            *slot = None;
        }
    }
}

impl Default for ComputationGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::grad_fn::NegBackward;

    #[test]
    fn test_graph_creation() {
        let graph = ComputationGraph::default();
        assert!(graph.is_empty());
        assert_eq!(graph.len(), 0);
    }

    #[test]
    fn test_only_trainable_leaves_are_registered() {
        let mut graph = ComputationGraph::new();
        let w = Tensor::from_slice(&[1.0]).requires_grad();
        let x = Tensor::from_slice(&[2.0]);

        graph.register_tensor(&w);
        graph.register_tensor(&x);

        assert!(graph.leaves.contains_key(&w.id()));
        assert!(!graph.leaves.contains_key(&x.id()));
    }

    #[test]
    fn test_backward_through_recorded_op() {
        let mut graph = ComputationGraph::new();
        let w = Tensor::from_slice(&[1.0, 2.0]).requires_grad();
        let out = Tensor::from_slice(&[-1.0, -2.0]);
        graph.register_tensor(&w);
        graph.record(out.id(), Arc::new(NegBackward), vec![w.id()]);

        graph.backward(out.id(), Tensor::ones(&[2]));
        assert_eq!(graph.get_grad(w.id()).expect("grad").data(), &[-1.0, -1.0]);

        graph.clear_grad(w.id());
        assert!(graph.get_grad(w.id()).is_none());
    }

    #[test]
    fn test_fan_out_accumulates() {
        let mut graph = ComputationGraph::new();
        let w = Tensor::from_slice(&[3.0]).requires_grad();
        let a = Tensor::from_slice(&[-3.0]);
        let b = Tensor::from_slice(&[-3.0]);
        graph.register_tensor(&w);
        graph.record(a.id(), Arc::new(NegBackward), vec![w.id()]);
        graph.record(b.id(), Arc::new(NegBackward), vec![w.id()]);

        graph.backward(a.id(), Tensor::ones(&[1]));
        graph.backward(b.id(), Tensor::ones(&[1]));
        assert_eq!(graph.get_grad(w.id()).expect("grad").data(), &[-2.0]);
    }

    #[test]
    fn test_clear() {
        let mut graph = ComputationGraph::new();
        let w = Tensor::from_slice(&[1.0]).requires_grad();
        graph.register_tensor(&w);
        graph.record(TensorId::new(), Arc::new(NegBackward), vec![w.id()]);

        graph.clear();
        assert!(graph.is_empty());
        assert!(graph.leaves.is_empty());
    }
}
