//! Control-plane replies and their wire form.
//!
//! Peers compare replies against the sentinel strings byte for byte, so
//! the literals below never change.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use djinn_controller::ControllerError;
use djinn_state::PropertyError;

pub const BAD_SECRET_MSG: &str = "false: bad secret";
pub const BAD_INPUT_MSG: &str = r#"{"success":false,"message":"bad input"}"#;
pub const KEY_NOT_FOUND: &str = r#"{"success":false,"message":"key not found"}"#;
pub const NOT_READY: &str = "false: not ready yet";
pub const OK: &str = "OK";

/// The outcome of one control-plane call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Bool(bool),
    Text(String),
    Json(Value),
    BadSecret,
    BadInput,
    KeyNotFound,
    /// Deployment parameters have not arrived yet.
    NotReady,
    Error(String),
}

impl Reply {
    pub fn json<T: Serialize>(value: &T) -> Reply {
        match serde_json::to_value(value) {
            Ok(v) => Reply::Json(v),
            Err(e) => Reply::Error(e.to_string()),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok => f.write_str(OK),
            Reply::Bool(b) => write!(f, "{b}"),
            Reply::Text(s) => f.write_str(s),
            Reply::Json(v) => write!(f, "{v}"),
            Reply::BadSecret => f.write_str(BAD_SECRET_MSG),
            Reply::BadInput => f.write_str(BAD_INPUT_MSG),
            Reply::KeyNotFound => f.write_str(KEY_NOT_FOUND),
            Reply::NotReady => f.write_str(NOT_READY),
            Reply::Error(reason) => write!(f, "Error: {reason}"),
        }
    }
}

impl From<ControllerError> for Reply {
    fn from(e: ControllerError) -> Self {
        match e {
            ControllerError::NotInitialized => Reply::NotReady,
            ControllerError::Property(PropertyError::Unknown(_)) => Reply::KeyNotFound,
            e if e.is_bad_input() => Reply::BadInput,
            e => Reply::Error(e.to_string()),
        }
    }
}
