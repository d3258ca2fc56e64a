use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("port {port} is used by both {first} and {second}")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    #[error("invalid fragment name {0:?}")]
    InvalidName(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{proxy} rejected the configuration: {output}")]
    Validation { proxy: String, output: String },

    #[error("{proxy} reload failed: {reason}")]
    Reload { proxy: String, reason: String },
}

impl ProxyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ProxyError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
