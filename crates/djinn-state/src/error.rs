//! Error types for cluster state validation.

use thiserror::Error;

/// Result type alias for node registry operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// Input could not be decoded into the expected shape.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Input decoded but violates a topology rule.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("invalid value for parameter {key}: {reason}")]
    InvalidParameter { key: String, reason: String },

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("port {port} is already in use on {host}")]
    PortInUse { host: String, port: u16 },

    #[error("no free port left in range starting at {0}")]
    PortsExhausted(u16),
}

impl StateError {
    /// Structural input errors the control plane reports as bad input
    /// rather than as a failed operation.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}
