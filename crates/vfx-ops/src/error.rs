//! Error types for filters, operators and graph descriptions.

use thiserror::Error;
use vfx_graph::GraphError;

/// Error type for image operations.
#[derive(Error, Debug)]
pub enum OpsError {
    /// Invalid dimensions specified.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// Invalid parameter value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation not supported for this input.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Malformed image file.
    #[error("bad file: {0}")]
    BadFile(String),

    /// Malformed graph description.
    #[error("graph description: {0}")]
    Description(String),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure inside the graph.
    #[error(transparent)]
    Graph(GraphError),
}

/// Result type for image operations.
pub type OpsResult<T> = Result<T, OpsError>;

impl From<GraphError> for OpsError {
    fn from(e: GraphError) -> Self {
        match e {
            GraphError::Io(io) => OpsError::Io(io),
            e => OpsError::Graph(e),
        }
    }
}

impl From<OpsError> for GraphError {
    fn from(e: OpsError) -> Self {
        match e {
            OpsError::Graph(e) => e,
            OpsError::Io(e) => GraphError::Io(e),
            OpsError::BadFile(m) => GraphError::Plugin(m),
            e => GraphError::Config(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_keeps_graph_errors() {
        let e: OpsError = GraphError::Aborted.into();
        assert!(matches!(GraphError::from(e), GraphError::Aborted));
    }

    #[test]
    fn test_parameter_errors_become_config() {
        let e = GraphError::from(OpsError::InvalidParameter("size < 0".into()));
        assert!(matches!(e, GraphError::Config(m) if m.contains("size < 0")));
    }
}
