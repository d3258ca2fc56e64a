//! Operations and replies exchanged with a coordination backend.

use serde::{Deserialize, Serialize};

use crate::backend::SessionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Get {
        path: String,
    },
    /// Create-or-update. With `expected_version` set, the node must exist
    /// at exactly that version.
    Set {
        path: String,
        value: String,
        #[serde(default)]
        ephemeral: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_version: Option<u64>,
    },
    /// Create-if-absent.
    Create {
        path: String,
        value: String,
        #[serde(default)]
        ephemeral: bool,
    },
    Delete {
        path: String,
    },
    Children {
        path: String,
    },
    Exists {
        path: String,
    },
}

impl Op {
    pub fn path(&self) -> &str {
        match self {
            Op::Get { path }
            | Op::Set { path, .. }
            | Op::Create { path, .. }
            | Op::Delete { path }
            | Op::Children { path }
            | Op::Exists { path } => path,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Op::Set { .. } | Op::Create { .. } | Op::Delete { .. })
    }
}

/// Metadata of a stored node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    /// Starts at 0, incremented on every write.
    pub version: u64,
    pub mtime_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral_owner: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum OpReply {
    Value { value: String, stat: NodeStat },
    Stat { stat: NodeStat },
    Children { names: Vec<String> },
    Exists { exists: bool },
    Deleted,
}

/// Body of `POST /coord/v1/ops`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpRequest {
    pub session: SessionId,
    pub op: Op,
}

/// Body of `POST /coord/v1/sessions`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionOpened {
    pub session: SessionId,
}

/// Every coordination HTTP response: `{"ok": ...}` or `{"err": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Wire<T> {
    Ok(T),
    Err(crate::error::CoordError),
}

impl<T> From<crate::error::CoordResult<T>> for Wire<T> {
    fn from(result: crate::error::CoordResult<T>) -> Self {
        match result {
            Ok(v) => Wire::Ok(v),
            Err(e) => Wire::Err(e),
        }
    }
}

impl<T> Wire<T> {
    pub fn into_result(self) -> crate::error::CoordResult<T> {
        match self {
            Wire::Ok(v) => Ok(v),
            Wire::Err(e) => Err(e),
        }
    }
}
