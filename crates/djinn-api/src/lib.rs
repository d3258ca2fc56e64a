//! djinn-api — the Djinn remote control plane.
//!
//! Peers, tooling and the node's own helpers reach a controller through
//! a fixed set of named operations, each authenticated by the deployment
//! secret. Replies are plain strings; failures are sentinel strings, not
//! transport errors, so older peers can compare them literally.
//!
//! # Architecture
//!
//! ```text
//!   POST /rpc/{operation} ──► router ──► ControlPlane::call
//!                                          ├── secret check  ──► "false: bad secret"
//!                                          ├── argument decode ─► BAD_INPUT
//!                                          └── Djinn operation ─► Reply (OK, JSON, text, Error: …)
//!
//!   PeerClient ── same transport, peer timeout, no retry ──► other controllers
//! ```

pub mod error;
pub mod peer;
pub mod plane;
pub mod reply;
pub mod router;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::{PeerError, PeerResult};
pub use peer::PeerClient;
pub use plane::{ControlPlane, Operation};
pub use reply::{BAD_INPUT_MSG, BAD_SECRET_MSG, KEY_NOT_FOUND, NOT_READY, Reply};
pub use router::control_router;
