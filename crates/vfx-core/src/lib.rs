//! # vfx-core
//!
//! Value types for the tiled, row-based image graph.
//!
//! This crate provides the foundational types used by `vfx-graph` and
//! `vfx-ops`:
//!
//! - [`Bbox`] - half-open integer box that is never empty
//! - [`Channel`], [`ChannelSet`], [`ChannelMap`] - channel ids and masks
//! - [`ChannelRegistry`] - name to channel allocator
//! - [`Format`], [`FormatRegistry`] - nominal image sizes
//! - [`World`] - the registries bundled for sharing
//!
//! ## Design Philosophy
//!
//! Regions of definition use edge-replicate semantics: reading outside a
//! box returns the nearest edge pixel. This is why a [`Bbox`] can never be
//! empty, and why a 1-pixel axis is treated as "constant" by the box
//! algebra.
//!
//! ## Crate Structure
//!
//! ```text
//! vfx-core (this crate)
//!    ^
//!    |
//!    +-- vfx-graph (rows, planes, operators, cache, deep)
//!           ^
//!           |
//!           +-- vfx-ops (filters, operator library, file plugins)
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod bbox;
pub mod channel;
pub mod error;
pub mod format;
pub mod world;

// Re-exports for convenience
pub use bbox::Bbox;
pub use channel::{Channel, ChannelMap, ChannelRegistry, ChannelSet};
pub use error::{Error, Result};
pub use format::{Format, FormatRegistry};
pub use world::World;

/// Prelude module for convenient imports.
///
/// # Usage
///
/// ```
/// use vfx_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bbox::Bbox;
    pub use crate::channel::{Channel, ChannelMap, ChannelRegistry, ChannelSet};
    pub use crate::error::{Error, Result};
    pub use crate::format::{Format, FormatRegistry};
    pub use crate::world::World;
}
