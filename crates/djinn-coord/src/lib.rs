//! djinn-coord — the coordination layer of the Djinn controller.
//!
//! A session-based, path-addressed key/value store with ephemeral nodes
//! and optimistic versions, plus the client every controller uses to talk
//! to it.
//!
//! # Architecture
//!
//! ```text
//!                    CoordinationClient
//!          (reconnect + retry, write backoff, lock)
//!                           │
//!                CoordinationBackend (trait)
//!                 ┌─────────┴──────────┐
//!        CoordinationTree         RemoteBackend
//!        (in-process,             (JSON over HTTP) ──► djinnd coordinator
//!         redb-persisted)                                   │
//!                                                  coordination_router
//!                                                  over a CoordinationTree
//! ```
//!
//! `ClusterStore` layers the controller's own schema (`/appcontroller/...`)
//! on top of the client.

pub mod backend;
pub mod client;
pub mod error;
pub mod lock;
pub mod op;
pub mod paths;
pub mod registry;
pub mod remote;
pub mod server;
pub mod tables;
pub mod transport;
pub mod tree;

pub use backend::{CoordinationBackend, SessionId};
pub use client::{ClientConfig, CoordinationClient, WriteOutcome};
pub use error::{CoordError, CoordResult};
pub use lock::{LockAcquisition, LockToken};
pub use op::{NodeStat, Op, OpReply};
pub use registry::{ClusterStore, IpsRecord, ScaleDirection, ScaleRequest};
pub use remote::RemoteBackend;
pub use server::{coordination_router, run_reaper};
pub use tree::CoordinationTree;
