//! Error taxonomy for coordination calls.
//!
//! Three classes matter to callers:
//! - transient (`ConnectionLoss`, `SessionExpired`): the client reconnects
//!   and retries on its own, forever;
//! - retryable writes (`OperationTimeout`, `System`): retried a bounded
//!   number of times with backoff, then abandoned;
//! - everything else is an application error and is returned immediately.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::SessionId;

/// Result type alias for coordination operations.
pub type CoordResult<T> = Result<T, CoordError>;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CoordError {
    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    #[error("session {0} expired")]
    SessionExpired(SessionId),

    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    #[error("coordination service error: {0}")]
    System(String),

    #[error("no node at {0}")]
    NoNode(String),

    #[error("node already exists at {0}")]
    NodeExists(String),

    #[error("version conflict at {path}: expected {expected}, found {actual}")]
    VersionConflict {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("node at {0} has children")]
    NotEmpty(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("could not reach the coordination service: {0}")]
    ConnectionError(String),

    #[error("timed out after {0}ms waiting for the lock")]
    LockTimeout(u64),

    #[error("call exceeded its {0}ms deadline")]
    Deadline(u64),
}

impl CoordError {
    /// Connection-class failures, retried transparently.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLoss(_) | Self::SessionExpired(_))
    }

    /// Failures a write may be retried on with backoff.
    pub fn is_retryable_write(&self) -> bool {
        matches!(self, Self::OperationTimeout(_) | Self::System(_))
    }
}
