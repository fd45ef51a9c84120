//! Error types for graph evaluation.
//!
//! # Overview
//!
//! Errors follow the three phases of evaluation:
//!
//! - [`GraphError::Validate`] - metadata could not be produced; the node
//!   stays in its error state until invalidated
//! - [`GraphError::Request`] - request before validate, or with channels
//!   nobody registered
//! - [`GraphError::Engine`] - a fatal fault while filling pixels
//!
//! [`GraphError::Aborted`] is cooperative cancellation and is not reported
//! as a failure by the drivers.
//!
//! # Dependencies
//!
//! - [`thiserror`] - For derive macro error implementation

use thiserror::Error;

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while building or evaluating a graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Metadata could not be produced.
    #[error("{op}: validate failed: {message}")]
    Validate {
        /// Operator name
        op: String,
        /// What went wrong
        message: String,
    },

    /// Request issued out of order or with unknown channels.
    #[error("request error: {0}")]
    Request(String),

    /// Fatal fault while computing pixels.
    #[error("{op}: engine failed: {message}")]
    Engine {
        /// Operator name
        op: String,
        /// What went wrong
        message: String,
    },

    /// Evaluation was cancelled through the context.
    #[error("aborted")]
    Aborted,

    /// A cached entry was poisoned by an earlier abort; request it again.
    #[error("cache entry poisoned by an earlier abort")]
    CachePoisoned,

    /// The graph contains a cycle through this operator.
    #[error("cycle detected at {0}")]
    Cycle(String),

    /// The operator handle is stale or was never issued.
    #[error("unknown operator {0}")]
    UnknownOp(String),

    /// A single frame of a sequence is unavailable.
    #[error("missing frame {frame} of {path}: {message}")]
    MissingFrame {
        /// Expanded file name
        path: String,
        /// Frame number
        frame: i32,
        /// Underlying failure
        message: String,
    },

    /// File-format plugin failure.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Bad parameter or graph description.
    #[error("config error: {0}")]
    Config(String),

    /// Core type error.
    #[error(transparent)]
    Core(#[from] vfx_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphError {
    /// Creates a [`GraphError::Validate`] error.
    #[inline]
    pub fn validate(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validate {
            op: op.into(),
            message: message.into(),
        }
    }

    /// Creates a [`GraphError::Engine`] error.
    #[inline]
    pub fn engine(op: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Engine {
            op: op.into(),
            message: message.into(),
        }
    }

    /// Creates a [`GraphError::Config`] error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a [`GraphError::Plugin`] error.
    #[inline]
    pub fn plugin(message: impl Into<String>) -> Self {
        Self::Plugin(message.into())
    }

    /// Returns `true` for cooperative cancellation.
    #[inline]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Returns `true` for errors that only become fatal in strict mode.
    #[inline]
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::MissingFrame { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_message() {
        let err = GraphError::validate("Blur1", "negative size");
        assert_eq!(err.to_string(), "Blur1: validate failed: negative size");
    }

    #[test]
    fn test_predicates() {
        assert!(GraphError::Aborted.is_aborted());
        assert!(!GraphError::Aborted.is_soft());
        let missing = GraphError::MissingFrame {
            path: "a.0003.pfm".into(),
            frame: 3,
            message: "not found".into(),
        };
        assert!(missing.is_soft());
    }

    #[test]
    fn test_core_conversion() {
        let err: GraphError = vfx_core::Error::UnknownChannel("x".into()).into();
        assert!(matches!(err, GraphError::Core(_)));
    }
}
