//! Service descriptions and the supervisor seam.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use djinn_core::BoxFuture;

use crate::error::{SupervisorError, SupervisorResult};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.@:-]{0,127}$").expect("service name pattern compiles")
});

/// Whether a name is safe to use as a watch name.
pub fn is_safe_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// What to run, where it listens, and with which environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub command: Vec<String>,
    pub ports: Vec<u16>,
    pub env: BTreeMap<String, String>,
    /// Restart when resident memory stays above this many MB.
    pub max_memory_mb: Option<u32>,
}

impl ServiceSpec {
    pub fn new(name: &str, command: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            command,
            ports: Vec::new(),
            env: BTreeMap::new(),
            max_memory_mb: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_max_memory(mut self, mb: u32) -> Self {
        self.max_memory_mb = Some(mb);
        self
    }

    pub fn validate(&self) -> SupervisorResult<()> {
        if !is_safe_name(&self.name) {
            return Err(SupervisorError::InvalidName(self.name.clone()));
        }
        if self.command.is_empty() {
            return Err(SupervisorError::InvalidCommand {
                service: self.name.clone(),
                reason: "empty command".to_string(),
            });
        }
        let quoted = self
            .command
            .iter()
            .chain(self.env.values())
            .chain(self.env.keys())
            .any(|s| s.contains('\'') || s.contains('"') || s.contains('\n'));
        if quoted {
            return Err(SupervisorError::InvalidCommand {
                service: self.name.clone(),
                reason: "quotes and newlines are not allowed".to_string(),
            });
        }
        Ok(())
    }
}

/// The external process supervisor.
///
/// `start` on a running service and `stop` on a stopped (or unknown)
/// service are successes.
pub trait ServiceSupervisor: Send + Sync {
    fn start<'a>(&'a self, spec: &'a ServiceSpec) -> BoxFuture<'a, SupervisorResult<()>>;

    fn stop<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SupervisorResult<()>>;

    fn is_running<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SupervisorResult<bool>>;
}
