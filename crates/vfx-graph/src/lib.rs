//! # vfx-graph
//!
//! Tiled, row-based, lazily evaluated image operator graph.
//!
//! Operators are connected into a [`Graph`] and evaluated on demand in
//! three phases:
//!
//! - **validate** - metadata ([`Info`], [`DeepInfo`]) flows downstream
//! - **request** - consumers declare region, channels and read count
//!   upstream
//! - **engine** - scanlines ([`Row`]) or deep boxes ([`DeepPlane`]) are
//!   pulled, possibly from many threads, through per-operator row caches
//!
//! ## Writing operators
//!
//! Implement [`Op`] plus [`Iop`] (flat), [`DeepOp`] (deep) or both. Most
//! operators fit one of the specialised shapes instead:
//!
//! | shape             | adapter          | computes                     |
//! |-------------------|------------------|------------------------------|
//! | [`PixelIop`]      | [`PixelOp`]      | pixel-local, one input row   |
//! | [`NoIop`]         | [`NoOp`]         | metadata only                |
//! | [`PlanarIop`]     | [`Planar`]       | whole stripes at once        |
//! | [`MultiTileIop`]  | [`MultiTile`]    | rows from an input tile      |
//!
//! ## Files
//!
//! [`Read`] and [`Write`] go through file-format plugins registered in a
//! [`PluginRegistry`]; [`Graph::execute`] drives a [`Write`].
//!
//! ## Feature Flags
//!
//! - `parallel` (default) - rayon for tile fills, stripe rendering and
//!   [`render_plane_parallel`]
//!
//! ## Dependencies
//!
//! - [`thiserror`] - error derive
//! - [`tracing`] - structured logging; no subscriber is installed
//! - [`serde`] - parameter bags and mode enums
//! - [`half`] - half-float plane storage
//! - [`smallvec`] - per-sample colour storage

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache;
pub mod context;
pub mod deep;
pub mod driver;
pub mod error;
pub mod graph;
pub mod info;
pub mod multitile;
pub mod noop;
pub mod op;
pub mod params;
pub mod pixel;
pub mod planar;
pub mod plane;
pub mod plugin;
pub mod read;
pub mod row;
pub mod tile;
pub mod write;

#[cfg(test)]
mod testing;

pub use cache::{CacheArena, CacheConfig, CacheStats, LineData, RowCache};
pub use context::{Context, OutputContext, ReportedError, Severity};
pub use deep::{DeepOrdering, DeepOutputPlane, DeepPixel, DeepPlane, DeepSample};
pub use driver::{RenderReport, render_plane, render_plane_parallel, render_rows};
pub use error::{GraphError, Result};
pub use graph::{Graph, Node, NodeState, OpId};
pub use info::{DeepInfo, Info, Info2D};
pub use multitile::{MultiTile, MultiTileIop};
pub use noop::{NoIop, NoOp, Passthrough};
pub use op::{
    DeepIop, DeepOp, EngineCx, InputInfo, InputRequest, Iop, Op, OpKind, PackedPreference, ValidateCx,
};
pub use params::{ParamValue, Params};
pub use pixel::{PixelIop, PixelOp};
pub use planar::{Planar, PlanarIop};
pub use plane::{ColorCurve, DataType, GenericData, GenericImagePlane, ImagePlane, StridedRow};
pub use plugin::{ImageSpec, PluginRegistry, Reader, ReaderFormat, Writer, WriterFormat};
pub use read::{MissingFrames, Read, ReadMode};
pub use row::{Row, is_zero_buffer, zero_buffer};
pub use tile::{BufferTile, GeneralTile, InputTile, Interest, Tile, TileAccess, TileKind};
pub use write::{Executable, ExecutePlan, ExecuteReport, Write, WriteJob};

/// Prelude module for operator authors.
///
/// # Usage
///
/// ```
/// use vfx_graph::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Context, DeepOp, DeepPlane, EngineCx, Graph, GraphError, ImagePlane, Info, Iop, NoIop, Op, OpId,
        PixelIop, PlanarIop, Result, Row, ValidateCx,
    };
    pub use vfx_core::{Bbox, Channel, ChannelSet, Format};
}
