//! Deep images: per-pixel lists of depth-ranged samples.
//!
//! # Overview
//!
//! A [`DeepPlane`] stores, for each pixel of a box, a variable number of
//! samples. Each sample carries the plane's channels plus
//! [`Channel::DEEP_FRONT`](vfx_core::Channel::DEEP_FRONT) and
//! [`Channel::DEEP_BACK`](vfx_core::Channel::DEEP_BACK). Deep operators
//! produce planes with a [`DeepOutputPlane`] builder.
//!
//! The utilities in [`ops`] work on detached [`DeepSample`] lists:
//!
//! - [`combine_overlapping`] - split at every depth boundary, merge what
//!   coincides, stop at the first opaque sample
//! - [`tidy`] - drop empty samples and combine
//! - [`composite`] - front-to-back premultiplied over to a flat pixel
//!
//! # Usage
//!
//! ```rust
//! use vfx_graph::deep::{composite, DeepSample};
//!
//! let front = DeepSample::point(1.0, 0.5, &[0.5]);
//! let back = DeepSample::point(2.0, 0.5, &[0.5]);
//! let flat = composite(&[front, back]);
//! assert_eq!(flat.alpha, 0.75);
//! assert_eq!(flat.color[0], 0.75);
//! ```

pub mod ops;
mod plane;

pub use ops::{CombineMode, Composite, combine_overlapping, composite, tidy};
pub use plane::{DeepOrdering, DeepOutputPlane, DeepPixel, DeepPlane, DeepSample};
