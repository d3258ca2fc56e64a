//! djinn-controller — the per-node Djinn controller.
//!
//! Holds the process context ([`Djinn`]), turns the node registry into
//! running roles, keeps the load balancers pointed at the right places,
//! and, on the head node, reaps dead nodes and acts on scale requests.
//!
//! # Architecture
//!
//! ```text
//!   set_parameters ──► bootstrap ──► ClusterStore (params, job data, ips)
//!                                         │
//!   run() ── every interval ──► engine::reconcile_once
//!                                 ├── role_delta ──► RoleHandler start / stop
//!                                 ├── app instances on this node
//!                                 ├── load balancer: route_app, route_services
//!                                 └── head only: reap_dead_nodes, scaling_pass
//!
//!   Phase: initializing ─► loading-roles ─► done-loading ◄─► reconciling
//! ```
//!
//! Fatal failures (too many failed passes in a row) write a crash record
//! and end the loop.

pub mod apps;
pub mod bootstrap;
pub mod context;
pub mod engine;
pub mod error;
pub mod head;
pub mod phase;
pub mod provider;
pub mod roles;

#[cfg(test)]
pub(crate) mod testutil;

pub use djinn_core::BoxFuture;

pub use bootstrap::{FanOutReport, fan_out};
pub use context::{ClusterState, Djinn};
pub use engine::{PassOutcome, RoleDelta, role_delta};
pub use error::{ControllerError, ControllerResult};
pub use head::ScaleAction;
pub use phase::{CrashRecord, Phase};
pub use provider::{InstanceProvider, NoPeers, PeerNotifier, PooledProvider, StaticProvider};
pub use roles::{RoleHandler, ServiceCatalog, handler_for};
