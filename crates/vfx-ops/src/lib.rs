//! # vfx-ops
//!
//! Filters, samplers and concrete operators for the `vfx-graph` engine.
//!
//! Each operator is written against one of the graph's operator shapes,
//! so this crate doubles as a catalogue of how those shapes are used.
//!
//! # Modules
//!
//! - [`filter`] - reconstruction filter kernels and weight tables
//! - [`sample`] - filtered sampling of tiles over rectangles and
//!   parallelograms
//! - [`blur`] - separable convolution with a pyramid path for large sizes
//! - [`constant`] - solid colour generator
//! - [`multiply`] - per-channel gain ([`PixelIop`](vfx_graph::PixelIop))
//! - [`metadata`] - format and frame-range overrides
//!   ([`NoIop`](vfx_graph::NoIop))
//! - [`resize`] - integer-factor stretch with linear interpolation
//! - [`transform`] - affine resampling
//!   ([`MultiTileIop`](vfx_graph::MultiTileIop))
//! - [`composite`] - Porter-Duff and blend-mode merge of two inputs
//! - [`deep`] - flat-to-deep, deep-to-flat and deep merge
//! - [`pfm`] - Portable Float Map reader and writer plugin
//! - [`builder`] - graphs from YAML descriptions
//!
//! # Example
//!
//! ```rust
//! use vfx_core::{Bbox, Channel, ChannelSet, Format};
//! use vfx_graph::{Context, Graph, PixelOp, Row};
//! use vfx_ops::constant::Constant;
//! use vfx_ops::multiply::Multiply;
//!
//! let mut constant = Constant::new(&[0.25, 0.5, 1.0, 1.0]);
//! constant.set_format(Some(Format::new(16, 16, 1.0)));
//!
//! let mut graph = Graph::new();
//! let src = graph.add_iop("Constant1", constant);
//! let gain = graph.add_iop("Multiply1", PixelOp::new(Multiply::new(2.0)));
//! graph.set_inputs(gain, &[src]).unwrap();
//!
//! let ctx = Context::default();
//! graph.validate(gain, &ctx, true).unwrap();
//! graph.request(gain, Bbox::new(0, 0, 16, 16), &ChannelSet::rgba(), 1, &ctx).unwrap();
//! let mut row = Row::new(0, 16);
//! graph.engine(gain, &ctx, 3, 0, 16, &ChannelSet::rgba(), &mut row).unwrap();
//! assert_eq!(row.at(Channel::RED, 5), 0.5);
//! assert_eq!(row.at(Channel::ALPHA, 5), 1.0);
//! ```
//!
//! ## Feature Flags
//!
//! - `parallel` (default) - rayon for blur passes and the graph's
//!   parallel paths

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod error;

pub mod blur;
pub mod builder;
pub mod composite;
pub mod constant;
pub mod deep;
pub mod filter;
pub mod metadata;
pub mod multiply;
pub mod pfm;
pub mod resize;
pub mod sample;
pub mod transform;

pub use blur::Blur;
pub use builder::{BuildEnv, GraphDesc, NodeDesc, OpRegistry};
pub use composite::{Merge, MergeMode};
pub use constant::Constant;
pub use deep::{DeepFromImage, DeepMerge, DeepToImage};
pub use error::{OpsError, OpsResult};
pub use filter::{Filter, Weights};
pub use metadata::{FrameRange, SetFormat};
pub use multiply::Multiply;
pub use pfm::PfmFormat;
pub use resize::Stretch;
pub use transform::Transform;
