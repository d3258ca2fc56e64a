use thiserror::Error;

pub type PeerResult<T> = Result<T, PeerError>;

/// Failures talking to another controller. None are retried.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("node {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    #[error("node {node} rejected our secret")]
    BadSecret { node: String },

    #[error("node {node} answered {operation} with {reply:?}")]
    Rejected {
        node: String,
        operation: String,
        reply: String,
    },

    #[error("node {node} sent an undecodable {operation} reply: {reason}")]
    Decode {
        node: String,
        operation: String,
        reason: String,
    },
}

impl PeerError {
    pub fn node(&self) -> &str {
        match self {
            PeerError::Unreachable { node, .. }
            | PeerError::BadSecret { node }
            | PeerError::Rejected { node, .. }
            | PeerError::Decode { node, .. } => node,
        }
    }
}
