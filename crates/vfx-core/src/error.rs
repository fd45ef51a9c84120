//! Error types for vfx-core.
//!
//! # Overview
//!
//! The [`Error`] enum covers failures of the value types in this crate:
//! - Malformed boxes coming from user input
//! - Channel name lookup and channel-id exhaustion
//! - Format registry lookups
//! - I/O (when wrapped by higher crates)
//!
//! # Usage
//!
//! ```rust
//! use vfx_core::{ChannelRegistry, Error};
//!
//! let reg = ChannelRegistry::new();
//! match reg.parse("") {
//!     Err(Error::UnknownChannel(name)) => assert!(name.is_empty()),
//!     _ => unreachable!(),
//! }
//! ```
//!
//! # Dependencies
//!
//! - [`thiserror`] - For derive macro error implementation
//!
//! # Used By
//!
//! - `vfx-graph` - wraps it in `GraphError::Core`
//! - `vfx-ops` - parameter validation

use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from core value types.
#[derive(Debug, Error)]
pub enum Error {
    /// A box was described with inverted or non-finite coordinates.
    #[error("invalid box [{x} {y} {r} {t}]: {reason}")]
    InvalidBox {
        /// Left
        x: i32,
        /// Bottom
        y: i32,
        /// Right (exclusive)
        r: i32,
        /// Top (exclusive)
        t: i32,
        /// What is wrong with it
        reason: String,
    },

    /// Channel name could not be resolved.
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    /// Every channel id up to the last one is in use.
    #[error("no free channel id for '{0}'")]
    ChannelSpaceExhausted(String),

    /// Format name not found in the registry.
    #[error("unknown format '{0}'")]
    UnknownFormat(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with custom message.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Creates an [`Error::InvalidBox`] error.
    #[inline]
    pub fn invalid_box(x: i32, y: i32, r: i32, t: i32, reason: impl Into<String>) -> Self {
        Self::InvalidBox {
            x,
            y,
            r,
            t,
            reason: reason.into(),
        }
    }

    /// Creates an [`Error::Other`] error.
    #[inline]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Returns `true` for channel lookup errors.
    #[inline]
    pub fn is_channel_error(&self) -> bool {
        matches!(self, Self::UnknownChannel(_) | Self::ChannelSpaceExhausted(_))
    }

    /// Returns `true` if this is an I/O error.
    #[inline]
    pub fn is_io_error(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_box_message() {
        let err = Error::invalid_box(10, 0, 5, 4, "r < x");
        let msg = err.to_string();
        assert!(msg.contains("[10 0 5 4]"));
        assert!(msg.contains("r < x"));
    }

    #[test]
    fn test_channel_errors() {
        assert!(Error::UnknownChannel("foo.bar".into()).is_channel_error());
        assert!(Error::ChannelSpaceExhausted("x.y".into()).is_channel_error());
        assert!(!Error::other("x").is_channel_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.is_io_error());
    }
}
