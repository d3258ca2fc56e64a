use std::path::PathBuf;

use thiserror::Error;

use djinn_coord::CoordError;
use djinn_proxy::ProxyError;
use djinn_state::{PropertyError, Role, StateError};
use djinn_supervisor::SupervisorError;

pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Coord(#[from] CoordError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error("deployment parameters have not been set")]
    NotInitialized,

    #[error("app {0} not found")]
    AppNotFound(String),

    #[error("invalid app id {0:?}")]
    InvalidAppId(String),

    #[error("port is already in use: {port} belongs to {owner}")]
    PortTaken { port: u16, owner: String },

    #[error("role {role} failed: {reason}")]
    RoleFailed { role: Role, reason: String },

    /// The bounded-failure escalation: the controller must stop.
    #[error("{count} consecutive reconciliation failures, last: {last}")]
    TooManyFailures { count: u32, last: String },

    #[error("node {node} unreachable: {reason}")]
    PeerUnreachable { node: String, reason: String },

    #[error("instance provider: {0}")]
    Provider(String),

    #[error("could not write crash record {path}: {source}")]
    CrashRecord {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ControllerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControllerError::TooManyFailures { .. })
    }

    /// Structural input errors, as opposed to failed operations.
    pub fn is_bad_input(&self) -> bool {
        match self {
            ControllerError::State(e) => e.is_malformed(),
            ControllerError::Property(PropertyError::BadValue { .. }) => true,
            _ => false,
        }
    }
}
