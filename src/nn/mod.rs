//! Layers, graphs and training for fully convolutional networks.
//!
//! Networks are assembled as a [`Graph`] of named [`Layer`]s applied to
//! [`SymbolicTensor`]s, Keras functional-API style, and executed by a
//! [`Model`]:
//!
//! - **Convolution**: [`Conv2d`], [`Conv2dTranspose`]
//! - **Pooling**: [`MaxPool2d`]
//! - **Resampling**: [`BilinearUpSampling2D`], [`CroppingLike2D`], [`ZeroPadding2D`]
//! - **Merging**: [`Add`], [`Scale`]
//! - **Activations**: [`Softmax`] (convolutions fuse [`Activation`])
//! - **Regularization**: [`Dropout`], per-kernel L2
//!
//! # Example
//!
//! ```
//! use fcn::config::BackendConfig;
//! use fcn::nn::{Activation, Conv2d, Graph, Model, Softmax};
//!
//! let mut graph = Graph::new(BackendConfig::default());
//! let x = graph.input(&[32, 32, 3])?;
//! let h = graph.apply(Conv2d::new(16, (3, 3)).activation(Activation::Relu), &[&x])?;
//! let s = graph.apply(Conv2d::new(2, (1, 1)), &[&h])?;
//! let p = graph.apply_named("score", Softmax::new(), &[&s])?;
//! let model = Model::new(graph, &[x], &[p])?;
//! assert_eq!(model.output_shape(), &[32, 32, 2]);
//! # Ok::<(), fcn::FcnError>(())
//! ```
//!
//! # References
//!
//! - Long, J., Shelhamer, E., & Darrell, T. (2015). Fully convolutional
//!   networks for semantic segmentation. CVPR.
//! - He, K., et al. (2015). Delving deep into rectifiers. ICCV.

mod activation;
mod conv;
mod crop;
mod dropout;
mod graph;
pub mod init;
mod layer;
pub mod loss;
mod merge;
pub mod metrics;
mod model;
pub mod optim;
mod pooling;
mod upsampling;

pub use activation::Softmax;
pub use conv::{flip_kernel_spatially, Activation, Conv2d, Conv2dTranspose, Padding};
pub use crop::{CropOffset, CroppingLike2D, ZeroPadding2D};
pub use dropout::Dropout;
pub use graph::{Graph, InputLayer, SymbolicTensor};
pub use layer::{format_shape, BuildContext, ImageDims, Initializer, Layer, ParamRole, Parameter};
pub use merge::{Add, Scale};
pub use model::{History, Model};
pub use pooling::MaxPool2d;
pub use upsampling::BilinearUpSampling2D;
