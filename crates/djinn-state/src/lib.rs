//! djinn-state — typed cluster state for the Djinn controller.
//!
//! The node registry (`Node`, `NodeSet`), the role vocabulary (`Role`),
//! deployment parameters and their mutable allow-list, and application
//! instance records with per-host port bookkeeping.
//!
//! # Architecture
//!
//! ```text
//! set_parameters(layout, options)
//!        │
//!        ├── Layout::parse ──► validate ──► NodeSet ──► RoleAssignment
//!        │
//!        └── DeploymentParams::from_options
//!
//! AppRecord ──► AppInstance (host, port)  ── PortAllocator
//! ```
//!
//! Everything here is plain data: JSON-serializable, no I/O. Durability
//! and replication are the coordination layer's job.

pub mod apps;
pub mod error;
pub mod layout;
pub mod node;
pub mod params;
pub mod role;

pub use apps::{AppInstance, AppRecord, PortAllocator};
pub use error::{StateError, StateResult};
pub use layout::Layout;
pub use node::{Node, NodeSet, RoleAssignment};
pub use params::{DeploymentParams, PropertyError};
pub use role::Role;
