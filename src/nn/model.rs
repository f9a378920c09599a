//! Executable models over a [`Graph`].
//!
//! A [`Model`] fixes which graph inputs are fed and which outputs are
//! produced, evaluates the nodes in between, and drives training with a
//! compiled [`Optimizer`].

use std::path::Path;

use tracing::{debug, info};

use super::graph::{Graph, SymbolicTensor};
use super::layer::{format_shape, Layer, ParamRole};
use super::loss::{l2_penalty, CategoricalCrossentropy};
use super::metrics::pixel_accuracy;
use super::optim::Optimizer;
use crate::autograd::{clear_graph, no_grad, Tensor};
use crate::error::{FcnError, Result};
use crate::serialization::{save_hdf5_archive, save_weight_archive, StoredWeight};

/// Per-epoch training record returned by [`Model::fit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    /// Mean training loss of each epoch
    pub loss: Vec<f32>,
}

/// A graph with designated inputs and outputs.
pub struct Model {
    graph: Graph,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    /// Nodes needed for the outputs, in evaluation order
    order: Vec<usize>,
    optimizer: Option<Box<dyn Optimizer>>,
}

impl Model {
    /// Wraps `graph`, evaluating `outputs` from `inputs`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::InvalidArchitecture`] if a tensor does not
    /// belong to the graph, an input is not an input layer, or an output
    /// depends on an input that is not listed.
    pub fn new(graph: Graph, inputs: &[SymbolicTensor], outputs: &[SymbolicTensor]) -> Result<Self> {
        if outputs.is_empty() {
            return Err(FcnError::InvalidArchitecture("a model needs at least one output".into()));
        }
        let nodes = graph.nodes();
        for t in inputs.iter().chain(outputs) {
            if nodes.get(t.node()).map(|n| n.output_shape.as_slice()) != Some(t.shape()) {
                return Err(FcnError::InvalidArchitecture(
                    "tensor does not belong to this graph".into(),
                ));
            }
        }
        let inputs: Vec<usize> = inputs.iter().map(SymbolicTensor::node).collect();
        if let Some(&bad) = inputs.iter().find(|&&i| nodes[i].layer.kind() != "input") {
            return Err(FcnError::InvalidArchitecture(format!(
                "`{}` is not an input layer",
                nodes[bad].name
            )));
        }

        let mut needed = vec![false; nodes.len()];
        let mut stack: Vec<usize> = outputs.iter().map(SymbolicTensor::node).collect();
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut needed[id], true) {
                continue;
            }
            let node = &nodes[id];
            if node.inputs.is_empty() && !inputs.contains(&id) {
                return Err(FcnError::InvalidArchitecture(format!(
                    "graph disconnected: `{}` is required but not a model input",
                    node.name
                )));
            }
            stack.extend(&node.inputs);
        }
        let order: Vec<usize> = (0..nodes.len()).filter(|&id| needed[id]).collect();
        debug!(layers = order.len(), "model assembled");

        Ok(Self {
            graph,
            inputs,
            outputs: outputs.iter().map(SymbolicTensor::node).collect(),
            order,
            optimizer: None,
        })
    }

    /// Underlying graph.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Names of the model's layers in evaluation order.
    #[must_use]
    pub fn layer_names(&self) -> Vec<&str> {
        let nodes = self.graph.nodes();
        self.order.iter().map(|&id| nodes[id].name.as_str()).collect()
    }

    /// Layer called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::UnknownLayer`] if there is none.
    pub fn get_layer(&self, name: &str) -> Result<&dyn Layer> {
        self.graph.get_layer(name)
    }

    /// Per-sample output shape of the layer called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::UnknownLayer`] if there is none.
    pub fn layer_output_shape(&self, name: &str) -> Result<&[usize]> {
        self.graph.layer_output_shape(name)
    }

    /// Per-sample shape of the first output.
    #[must_use]
    pub fn output_shape(&self) -> &[usize] {
        &self.graph.nodes()[self.outputs[0]].output_shape
    }

    /// Per-sample shapes of every output.
    #[must_use]
    pub fn output_shapes(&self) -> Vec<&[usize]> {
        let nodes = self.graph.nodes();
        self.outputs.iter().map(|&id| nodes[id].output_shape.as_slice()).collect()
    }

    /// Per-sample shape of the first input.
    #[must_use]
    pub fn input_shape(&self) -> Option<&[usize]> {
        self.inputs
            .first()
            .map(|&id| self.graph.nodes()[id].output_shape.as_slice())
    }

    /// Keras-style summary: one `name (kind) (None, ...)` line per layer.
    #[must_use]
    pub fn summary(&self) -> String {
        let nodes = self.graph.nodes();
        self.order
            .iter()
            .map(|&id| {
                let n = &nodes[id];
                format!("{} ({}) {}\n", n.name, n.layer.kind(), format_shape(&n.output_shape))
            })
            .collect()
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn count_params(&self) -> usize {
        let nodes = self.graph.nodes();
        self.order
            .iter()
            .flat_map(|&id| nodes[id].layer.params())
            .map(super::layer::Parameter::numel)
            .sum()
    }

    /// Number of weight tensors the optimizer updates.
    #[must_use]
    pub fn trainable_weight_count(&self) -> usize {
        let nodes = self.graph.nodes();
        self.order
            .iter()
            .filter(|&&id| nodes[id].trainable)
            .map(|&id| nodes[id].layer.params().len())
            .sum()
    }

    /// Freezes or unfreezes the layer called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::UnknownLayer`] if there is none.
    pub fn set_trainable(&mut self, name: &str, trainable: bool) -> Result<()> {
        self.graph.set_trainable(name, trainable)
    }

    /// Whether the optimizer updates the layer called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::UnknownLayer`] if there is none.
    pub fn is_trainable(&self, name: &str) -> Result<bool> {
        self.graph.is_trainable(name)
    }

    /// Sets the optimizer used by [`Model::train_on_batch`] and [`Model::fit`].
    pub fn compile(&mut self, optimizer: impl Optimizer + 'static) {
        self.optimizer = Some(Box::new(optimizer));
    }

    /// Evaluates the model on a batch, without gradient tracking.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::InvalidInput`] or [`FcnError::ShapeMismatch`] if
    /// `x` does not match the model input.
    pub fn predict(&mut self, x: &Tensor) -> Result<Tensor> {
        self.graph.materialize();
        let mut outputs = no_grad(|| self.run(&[x], false))?;
        Ok(outputs.swap_remove(0))
    }

    /// Outputs of every model output for the given inputs.
    ///
    /// # Errors
    ///
    /// Returns an error if the inputs do not match the model inputs.
    pub fn predict_all(&mut self, inputs: &[&Tensor]) -> Result<Vec<Tensor>> {
        self.graph.materialize();
        no_grad(|| self.run(inputs, false))
    }

    fn run(&self, inputs: &[&Tensor], training: bool) -> Result<Vec<Tensor>> {
        if inputs.len() != self.inputs.len() {
            return Err(FcnError::InvalidInput(format!(
                "model expects {} inputs, got {}",
                self.inputs.len(),
                inputs.len()
            )));
        }
        let nodes = self.graph.nodes();

        // Remaining consumers per node; values are dropped once unused
        let mut uses = vec![0usize; nodes.len()];
        for &id in &self.order {
            for &input in &nodes[id].inputs {
                uses[input] += 1;
            }
        }
        for &id in &self.outputs {
            uses[id] += 1;
        }

        let mut values: Vec<Option<Tensor>> = vec![None; nodes.len()];
        for &id in &self.order {
            let node = &nodes[id];
            let out = if let Some(k) = self.inputs.iter().position(|&i| i == id) {
                node.layer.forward(&[inputs[k]], training)?
            } else {
                let args = node
                    .inputs
                    .iter()
                    .map(|&i| {
                        values[i].as_ref().ok_or_else(|| {
                            FcnError::InvalidArchitecture(format!("`{}` evaluated before its inputs", node.name))
                        })
                    })
                    .collect::<Result<Vec<&Tensor>>>()?;
                node.layer.forward(&args, training)?
            };
            values[id] = Some(out);
            for &input in &node.inputs {
                uses[input] -= 1;
                if uses[input] == 0 {
                    values[input] = None;
                }
            }
        }

        self.outputs
            .iter()
            .map(|&id| {
                values[id]
                    .clone()
                    .ok_or_else(|| FcnError::InvalidArchitecture("output was not computed".into()))
            })
            .collect()
    }

    fn loss_of(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        let criterion = CategoricalCrossentropy::new(self.graph.data_format())
            .epsilon(self.graph.config().epsilon);
        let loss = criterion.forward(pred, target)?;
        let nodes = self.graph.nodes();
        let kernels = self
            .order
            .iter()
            .flat_map(|&id| nodes[id].layer.params())
            .filter(|p| p.role() == ParamRole::Kernel)
            .filter_map(|p| p.value().map(|v| (v, p.l2())));
        Ok(match l2_penalty(kernels) {
            Some(penalty) => loss.add(&penalty),
            None => loss,
        })
    }

    /// One optimisation step on a batch; returns the loss before the update.
    ///
    /// The loss is per-pixel categorical cross-entropy of the first output
    /// against the one-hot `y`, plus the L2 penalties of every kernel.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::Config`] if the model was not compiled, or a
    /// shape error if `x`/`y` do not match the model.
    pub fn train_on_batch(&mut self, x: &Tensor, y: &Tensor) -> Result<f32> {
        if self.optimizer.is_none() {
            return Err(FcnError::Config("model must be compiled before training".into()));
        }
        self.graph.materialize();
        clear_graph();

        let step = self.run(&[x], true).and_then(|outputs| self.loss_of(&outputs[0], y));
        let loss = match step {
            Ok(loss) => loss,
            Err(err) => {
                clear_graph();
                return Err(err);
            }
        };
        loss.backward();

        let mut params = self.graph.trainable_values_mut();
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.step_with_params(&mut params);
        }
        clear_graph();
        Ok(loss.item())
    }

    /// Loss and pixel accuracy of the first output on a batch.
    ///
    /// # Errors
    ///
    /// Returns a shape error if `x`/`y` do not match the model.
    pub fn evaluate(&mut self, x: &Tensor, y: &Tensor) -> Result<(f32, f32)> {
        self.graph.materialize();
        no_grad(|| {
            let outputs = self.run(&[x], false)?;
            let loss = self.loss_of(&outputs[0], y)?;
            let accuracy = pixel_accuracy(&outputs[0], y, self.graph.data_format())?;
            Ok((loss.item(), accuracy))
        })
    }

    /// Trains for `epochs` passes over `x`/`y` in order, `batch_size`
    /// samples per step.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::InvalidInput`] for an empty dataset, mismatched
    /// sample counts or a zero batch size, and propagates step errors.
    pub fn fit(&mut self, x: &Tensor, y: &Tensor, batch_size: usize, epochs: usize) -> Result<History> {
        let samples = x.shape().first().copied().unwrap_or(0);
        if samples == 0 || batch_size == 0 || y.shape().first() != Some(&samples) {
            return Err(FcnError::InvalidInput(format!(
                "cannot fit {:?} against {:?} with batch size {batch_size}",
                x.shape(),
                y.shape()
            )));
        }

        let mut history = History::default();
        for epoch in 0..epochs {
            let mut total = 0.0;
            let mut start = 0;
            while start < samples {
                let end = (start + batch_size).min(samples);
                let loss = self.train_on_batch(&x.narrow_batch(start, end), &y.narrow_batch(start, end))?;
                total += loss * (end - start) as f32;
                start = end;
            }
            let mean = total / samples as f32;
            info!(epoch = epoch + 1, epochs, loss = mean, "epoch finished");
            history.loss.push(mean);
        }
        Ok(history)
    }

    /// Current weights of every layer in evaluation order, weightless layers
    /// included with an empty list.
    ///
    /// Unset parameters are initialised first.
    pub fn get_weights(&mut self) -> Vec<(String, Vec<StoredWeight>)> {
        self.graph.materialize();
        let nodes = self.graph.nodes();
        self.order
            .iter()
            .map(|&id| {
                let node = &nodes[id];
                let weights = node
                    .layer
                    .params()
                    .iter()
                    .filter_map(|p| {
                        p.value().map(|v| StoredWeight {
                            name: format!("{}/{}", node.name, p.name()),
                            shape: p.shape().to_vec(),
                            data: v.data().to_vec(),
                        })
                    })
                    .collect();
                (node.name.clone(), weights)
            })
            .collect()
    }

    /// Writes all weights to `path`: HDF5 for `.h5`/`.hdf5`, `SafeTensors`
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns an I/O error, or [`FcnError::MissingCapability`] for HDF5
    /// without the `hdf5` feature.
    pub fn save_weights(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let layers = self.get_weights();
        let is_hdf5 = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("h5") || e.eq_ignore_ascii_case("hdf5"));
        info!(path = %path.display(), layers = layers.len(), "saving weights");
        if is_hdf5 {
            save_hdf5_archive(path, &layers)
        } else {
            save_weight_archive(path, &layers)
        }
    }

    /// Loads weights by layer name from an archive written by
    /// [`Model::save_weights`] or Keras.
    ///
    /// Returns the archive's layer names.
    ///
    /// # Errors
    ///
    /// Returns archive, I/O and shape errors.
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> Result<Vec<String>> {
        let nodes = 0..self.graph.len();
        crate::weights::load_weights(&mut self.graph, path.as_ref(), nodes)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("layers", &self.order.len())
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("compiled", &self.optimizer.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::nn::optim::SGD;
    use crate::nn::{Activation, Conv2d, Softmax};

    fn tiny() -> (Model, Tensor, Tensor) {
        let mut graph = Graph::new(BackendConfig::default()).with_seed(11);
        let x = graph.input(&[4, 4, 2]).expect("input");
        let h = graph
            .apply_named(
                "hidden",
                Conv2d::new(4, (3, 3)).activation(Activation::Relu).kernel_l2(1e-3),
                &[&x],
            )
            .expect("hidden");
        let s = graph.apply_named("logits", Conv2d::new(3, (1, 1)), &[&h]).expect("logits");
        let p = graph.apply_named("score", Softmax::new(), &[&s]).expect("softmax");
        let model = Model::new(graph, &[x], &[p]).expect("model");

        let data: Vec<f32> = (0..32).map(|i| ((i * 7) % 5) as f32 / 5.0).collect();
        let mut target = vec![0.0; 48];
        for pixel in 0..16 {
            target[pixel * 3 + pixel % 3] = 1.0;
        }
        (
            model,
            Tensor::from_vec(data, &[1, 4, 4, 2]),
            Tensor::from_vec(target, &[1, 4, 4, 3]),
        )
    }

    #[test]
    fn test_layers_and_shapes() {
        let (model, _, _) = tiny();
        assert_eq!(model.layer_names(), vec!["input_1", "hidden", "logits", "score"]);
        assert_eq!(model.output_shape(), &[4, 4, 3]);
        assert_eq!(model.input_shape(), Some(&[4, 4, 2][..]));
        assert_eq!(model.count_params(), 3 * 3 * 2 * 4 + 4 + 4 * 3 + 3);
        assert_eq!(model.trainable_weight_count(), 4);
        assert!(model.summary().contains("hidden (conv2d) (None, 4, 4, 4)"));
    }

    #[test]
    fn test_predict_gives_distributions() {
        let (mut model, x, _) = tiny();
        let y = model.predict(&x).expect("predict");
        assert_eq!(y.shape(), &[1, 4, 4, 3]);
        for pixel in y.data().chunks(3) {
            assert!((pixel.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_training_requires_compile() {
        let (mut model, x, y) = tiny();
        assert!(matches!(model.train_on_batch(&x, &y), Err(FcnError::Config(_))));
    }

    #[test]
    fn test_training_reduces_loss() {
        let (mut model, x, y) = tiny();
        model.compile(SGD::new(0.3));
        let first = model.train_on_batch(&x, &y).expect("step");
        for _ in 0..20 {
            model.train_on_batch(&x, &y).expect("step");
        }
        let (last, accuracy) = model.evaluate(&x, &y).expect("evaluate");
        assert!(first.is_finite() && last.is_finite());
        assert!(last < first, "{last} >= {first}");
        assert!((0.0..=1.0).contains(&accuracy));
    }

    #[test]
    fn test_frozen_layers_keep_weights() {
        let (mut model, x, y) = tiny();
        model.set_trainable("hidden", false).expect("freeze");
        assert_eq!(model.trainable_weight_count(), 2);
        model.compile(SGD::new(0.5));

        let before = model.get_weights();
        model.train_on_batch(&x, &y).expect("step");
        let after = model.get_weights();
        assert_eq!(before[1], after[1]);
        assert_ne!(before[2], after[2]);
    }

    #[test]
    fn test_fit_records_epochs() {
        let (mut model, x, y) = tiny();
        model.compile(SGD::new(0.1));
        let history = model.fit(&x, &y, 1, 3).expect("fit");
        assert_eq!(history.loss.len(), 3);
        assert!(history.loss.iter().all(|l| l.is_finite()));
        assert!(model.fit(&x, &y, 0, 1).is_err());
    }

    #[test]
    fn test_disconnected_input_rejected() {
        let mut graph = Graph::new(BackendConfig::default());
        let a = graph.input(&[4, 4, 1]).expect("input");
        let b = graph.input(&[4, 4, 1]).expect("input");
        let sum = graph.apply(crate::nn::Add::new(), &[&a, &b]).expect("add");
        assert!(matches!(
            Model::new(graph, &[a], &[sum]),
            Err(FcnError::InvalidArchitecture(_))
        ));
    }

    #[test]
    fn test_wrong_input_count() {
        let (mut model, x, _) = tiny();
        assert!(matches!(
            model.predict_all(&[&x, &x]),
            Err(FcnError::InvalidInput(_))
        ));
    }
}
