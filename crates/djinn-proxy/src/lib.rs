//! djinn-proxy — load balancer configuration for the Djinn controller.
//!
//! Renders HAProxy `listen` blocks and Nginx sites from application and
//! service state, and applies them without ever replacing a working
//! configuration with a broken one.
//!
//! # Architecture
//!
//! ```text
//!  AppRecord / BuiltinService
//!            │
//!        ProxySync ──► ProxyGenerator ──► ProxyController (trait)
//!                        │  fragments        ├── CommandController (haproxy, nginx)
//!                        │  assemble         └── DryRunController
//!                        │  diff, validate
//!                        └─ swap or roll back, reload with cooldown
//! ```

pub mod controller;
pub mod error;
pub mod generator;
pub mod haproxy;
pub mod nginx;
pub mod policy;
pub mod sync;

pub use controller::{CommandController, DryRunController, ProxyController, ProxyKind};
pub use error::{ProxyError, ProxyResult};
pub use generator::{ListenSpec, ProxyGenerator, RegenOutcome};
pub use haproxy::ListenBlock;
pub use nginx::NginxSite;
pub use policy::{BuiltinService, ConnectionPolicy};
pub use sync::{ProxySync, app_block_name};

use std::sync::Arc;

use djinn_core::config::ProxyConfig;

/// The controller named by the configuration.
pub fn controller_from_config(config: &ProxyConfig) -> Arc<dyn ProxyController> {
    if config.dry_run {
        Arc::new(DryRunController::new())
    } else {
        Arc::new(CommandController::new(
            config.haproxy_bin.clone(),
            config.nginx_bin.clone(),
            config.haproxy_dir.join("haproxy.pid"),
        ))
    }
}
