//! djinn-supervisor — the Djinn controller's view of the process supervisor.
//!
//! Roles never spawn processes themselves. They describe a service
//! ([`ServiceSpec`]) and ask a [`ServiceSupervisor`] to start, stop or
//! query it. Starting something already running and stopping something
//! already stopped both succeed.
//!
//! # Architecture
//!
//! ```text
//!   RoleHandler ──► ServiceSupervisor (trait)
//!                    ├── MonitSupervisor   writes conf.d file, runs `monit`
//!                    └── DryRunSupervisor  in-memory, for tests and dry runs
//!
//!   probe::wait_for_port ── bounded polling, PortTimeout on expiry
//! ```

pub mod dryrun;
pub mod error;
pub mod monit;
pub mod probe;
pub mod service;

pub use dryrun::{DryRunSupervisor, SupervisorEvent};
pub use error::{SupervisorError, SupervisorResult};
pub use monit::MonitSupervisor;
pub use probe::{is_port_open, wait_for_port};
pub use service::{ServiceSpec, ServiceSupervisor};

use std::sync::Arc;

use djinn_core::SupervisorKind;
use djinn_core::config::SupervisorConfig;

/// Build the supervisor named in the configuration.
pub fn from_config(config: &SupervisorConfig) -> Arc<dyn ServiceSupervisor> {
    match config.kind {
        SupervisorKind::Monit => Arc::new(MonitSupervisor::new(config.clone())),
        SupervisorKind::DryRun => Arc::new(DryRunSupervisor::new()),
    }
}
