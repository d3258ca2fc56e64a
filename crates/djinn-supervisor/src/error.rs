use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Service names end up in shell lines and file names.
    #[error("invalid service name {0:?}")]
    InvalidName(String),

    #[error("invalid command for {service}: {reason}")]
    InvalidCommand { service: String, reason: String },

    #[error("supervisor command `{command}` failed after {attempts} attempts")]
    CommandFailed { command: String, attempts: u32 },

    #[error("could not write {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not run supervisor: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{host}:{port} not reachable after {waited_ms}ms")]
    PortTimeout { host: String, port: u16, waited_ms: u64 },

    /// Injected by the dry-run supervisor.
    #[error("service {0} failed to start")]
    StartFailed(String),
}

impl SupervisorError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SupervisorError::PortTimeout { .. })
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
