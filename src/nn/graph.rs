//! Symbolic layer graphs.
//!
//! A [`Graph`] records layers applied to [`SymbolicTensor`]s. Every node is
//! built as soon as it is added, so output shapes are known while the
//! architecture is still being assembled. Nodes are stored in creation
//! order, which is also a valid evaluation order.
//!
//! # Example
//!
//! ```
//! use fcn::config::BackendConfig;
//! use fcn::nn::{Conv2d, Graph, MaxPool2d, Padding};
//!
//! let mut graph = Graph::new(BackendConfig::default());
//! let x = graph.input(&[64, 64, 3])?;
//! let y = graph.apply_named("block1_conv1", Conv2d::new(64, (3, 3)), &[&x])?;
//! let y = graph.apply(MaxPool2d::new((2, 2), (2, 2)).padding(Padding::Same), &[&y])?;
//! assert_eq!(y.shape(), &[32, 32, 64]);
//! # Ok::<(), fcn::FcnError>(())
//! ```

use std::collections::HashMap;

use super::layer::{check_batch, format_shape, BuildContext, ImageDims, Layer, Parameter};
use crate::autograd::Tensor;
use crate::config::{BackendConfig, DataFormat};
use crate::error::{FcnError, Result};

/// Placeholder for data fed into a graph.
#[derive(Debug, Clone)]
pub struct InputLayer {
    shape: Vec<usize>,
}

impl InputLayer {
    /// Input of per-sample `shape`.
    #[must_use]
    pub fn new(shape: &[usize]) -> Self {
        Self { shape: shape.to_vec() }
    }
}

impl Layer for InputLayer {
    fn kind(&self) -> &'static str {
        "input"
    }

    fn build(&mut self, input_shapes: &[&[usize]], _ctx: &mut BuildContext) -> Result<Vec<usize>> {
        if !input_shapes.is_empty() {
            return Err(FcnError::InvalidArchitecture("input layers take no inputs".into()));
        }
        if self.shape.is_empty() || self.shape.contains(&0) {
            return Err(FcnError::shape("input", "non-empty dimensions", &self.shape));
        }
        Ok(self.shape.clone())
    }

    fn forward(&self, inputs: &[&Tensor], _training: bool) -> Result<Tensor> {
        let x = inputs
            .first()
            .ok_or_else(|| FcnError::InvalidInput("missing value for input layer".into()))?;
        check_batch(x, &self.shape, self.kind())?;
        Ok((*x).clone())
    }
}

/// Handle to the output of a graph node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolicTensor {
    node: usize,
    shape: Vec<usize>,
}

impl SymbolicTensor {
    /// Per-sample shape (batch excluded).
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub(crate) fn node(&self) -> usize {
        self.node
    }
}

/// One layer application.
pub(crate) struct Node {
    pub name: String,
    pub layer: Box<dyn Layer>,
    pub inputs: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub trainable: bool,
}

/// A directed acyclic graph of named layers.
pub struct Graph {
    config: BackendConfig,
    ctx: BuildContext,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    counters: HashMap<&'static str, usize>,
}

impl Graph {
    /// Empty graph using the layout and constants of `config`.
    #[must_use]
    pub fn new(config: BackendConfig) -> Self {
        let ctx = BuildContext::new(config.image_data_format, None);
        Self {
            config,
            ctx,
            nodes: Vec::new(),
            index: HashMap::new(),
            counters: HashMap::new(),
        }
    }

    /// Makes every initializer and dropout mask derive from `seed`.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.ctx = BuildContext::new(self.config.image_data_format, Some(seed));
        self
    }

    /// Backend configuration the graph was created with.
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Image layout of every layer in the graph.
    #[must_use]
    pub fn data_format(&self) -> DataFormat {
        self.config.image_data_format
    }

    /// Adds an input placeholder named `input_<n>`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::ShapeMismatch`] for empty or zero-sized shapes.
    pub fn input(&mut self, shape: &[usize]) -> Result<SymbolicTensor> {
        self.apply(InputLayer::new(shape), &[])
    }

    /// Applies `layer` to `inputs` under an automatically generated name
    /// `<kind>_<n>`, counting from 1 per kind.
    ///
    /// # Errors
    ///
    /// Returns the layer's build error when the inputs are incompatible.
    pub fn apply<L: Layer + 'static>(&mut self, layer: L, inputs: &[&SymbolicTensor]) -> Result<SymbolicTensor> {
        let name = self.unique_name(layer.kind());
        self.add_node(name, Box::new(layer), inputs)
    }

    /// Applies `layer` to `inputs` under an explicit name.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::InvalidArchitecture`] if the name is taken, or the
    /// layer's build error when the inputs are incompatible.
    pub fn apply_named<L: Layer + 'static>(
        &mut self,
        name: impl Into<String>,
        layer: L,
        inputs: &[&SymbolicTensor],
    ) -> Result<SymbolicTensor> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(FcnError::InvalidArchitecture(format!(
                "duplicate layer name `{name}`"
            )));
        }
        self.add_node(name, Box::new(layer), inputs)
    }

    fn unique_name(&mut self, kind: &'static str) -> String {
        loop {
            let counter = self.counters.entry(kind).or_insert(0);
            *counter += 1;
            let name = format!("{kind}_{counter}");
            if !self.index.contains_key(&name) {
                return name;
            }
        }
    }

    fn add_node(
        &mut self,
        name: String,
        mut layer: Box<dyn Layer>,
        inputs: &[&SymbolicTensor],
    ) -> Result<SymbolicTensor> {
        let mut shapes = Vec::with_capacity(inputs.len());
        for input in inputs {
            let node = self.nodes.get(input.node).ok_or_else(|| {
                FcnError::InvalidArchitecture(format!("`{name}` applied to a tensor of another graph"))
            })?;
            if node.output_shape != input.shape {
                return Err(FcnError::InvalidArchitecture(format!(
                    "`{name}` applied to a tensor of another graph"
                )));
            }
            shapes.push(input.shape.as_slice());
        }

        let output_shape = layer.build(&shapes, &mut self.ctx).map_err(|err| match err {
            FcnError::ShapeMismatch {
                context,
                expected,
                actual,
            } => FcnError::ShapeMismatch {
                context: format!("{name}: {context}"),
                expected,
                actual,
            },
            other => other,
        })?;
        tracing::trace!(layer = %name, kind = layer.kind(), shape = %format_shape(&output_shape), "built layer");

        let id = self.nodes.len();
        self.index.insert(name.clone(), id);
        self.nodes.push(Node {
            name,
            layer,
            inputs: inputs.iter().map(|t| t.node).collect(),
            output_shape: output_shape.clone(),
            trainable: true,
        });
        Ok(SymbolicTensor {
            node: id,
            shape: output_shape,
        })
    }

    /// Spatial `(height, width)` of a symbolic image tensor.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::ShapeMismatch`] for non-image tensors.
    pub fn spatial_size(&self, tensor: &SymbolicTensor) -> Result<(usize, usize)> {
        let dims = ImageDims::from_shape(&tensor.shape, self.data_format())?;
        Ok((dims.height, dims.width))
    }

    /// Number of nodes, inputs included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when nothing has been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Layer names in creation order.
    pub fn layer_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    /// True when a layer called `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Layer called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::UnknownLayer`] if there is none.
    pub fn get_layer(&self, name: &str) -> Result<&dyn Layer> {
        Ok(self.nodes[self.position(name)?].layer.as_ref())
    }

    /// Mutable layer called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::UnknownLayer`] if there is none.
    pub fn get_layer_mut(&mut self, name: &str) -> Result<&mut dyn Layer> {
        let at = self.position(name)?;
        Ok(self.nodes[at].layer.as_mut())
    }

    /// Per-sample output shape of the layer called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::UnknownLayer`] if there is none.
    pub fn layer_output_shape(&self, name: &str) -> Result<&[usize]> {
        Ok(&self.nodes[self.position(name)?].output_shape)
    }

    /// Whether the optimizer updates the layer called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::UnknownLayer`] if there is none.
    pub fn is_trainable(&self, name: &str) -> Result<bool> {
        Ok(self.nodes[self.position(name)?].trainable)
    }

    /// Freezes (`false`) or unfreezes (`true`) the layer called `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FcnError::UnknownLayer`] if there is none.
    pub fn set_trainable(&mut self, name: &str, trainable: bool) -> Result<()> {
        let at = self.position(name)?;
        self.nodes[at].trainable = trainable;
        Ok(())
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| FcnError::UnknownLayer(name.to_string()))
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    /// Initialises every unset parameter and aligns gradient tracking with
    /// the trainable flags.
    pub(crate) fn materialize(&mut self) {
        for node in &mut self.nodes {
            let trainable = node.trainable;
            for param in node.layer.params_mut() {
                param.materialize().requires_grad_(trainable);
            }
        }
    }

    /// Values of every parameter of trainable layers, in graph order.
    pub(crate) fn trainable_values_mut(&mut self) -> Vec<&mut Tensor> {
        self.nodes
            .iter_mut()
            .filter(|n| n.trainable)
            .flat_map(|n| n.layer.params_mut().iter_mut().filter_map(Parameter::value_mut))
            .collect()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("data_format", &self.data_format())
            .field("layers", &self.nodes.len())
            .finish_non_exhaustive()
    }
}
