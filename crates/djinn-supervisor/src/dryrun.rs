//! In-memory supervisor: records what it was asked to do.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use tracing::info;

use djinn_core::BoxFuture;

use crate::error::{SupervisorError, SupervisorResult};
use crate::service::{ServiceSpec, ServiceSupervisor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Started(String),
    Stopped(String),
}

#[derive(Default)]
struct Inner {
    running: BTreeMap<String, ServiceSpec>,
    events: Vec<SupervisorEvent>,
    failing: BTreeSet<String>,
}

#[derive(Default)]
pub struct DryRunSupervisor {
    inner: Mutex<Inner>,
}

impl DryRunSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future start of `name` fail until [`Self::heal`].
    pub fn fail_starts_of(&self, name: &str) {
        self.lock().failing.insert(name.to_string());
    }

    pub fn heal(&self, name: &str) {
        self.lock().failing.remove(name);
    }

    /// Names of running services, sorted.
    pub fn running(&self) -> Vec<String> {
        self.lock().running.keys().cloned().collect()
    }

    pub fn spec(&self, name: &str) -> Option<ServiceSpec> {
        self.lock().running.get(name).cloned()
    }

    /// Every effective start and stop, in order. No-op calls are not recorded.
    pub fn events(&self) -> Vec<SupervisorEvent> {
        self.lock().events.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ServiceSupervisor for DryRunSupervisor {
    fn start<'a>(&'a self, spec: &'a ServiceSpec) -> BoxFuture<'a, SupervisorResult<()>> {
        Box::pin(async move {
            spec.validate()?;
            let mut inner = self.lock();
            if inner.failing.contains(&spec.name) {
                return Err(SupervisorError::StartFailed(spec.name.clone()));
            }
            if inner.running.contains_key(&spec.name) {
                return Ok(());
            }
            info!(service = %spec.name, ports = ?spec.ports, "dry-run start");
            inner.running.insert(spec.name.clone(), spec.clone());
            inner.events.push(SupervisorEvent::Started(spec.name.clone()));
            Ok(())
        })
    }

    fn stop<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SupervisorResult<()>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if inner.running.remove(name).is_some() {
                info!(service = %name, "dry-run stop");
                inner.events.push(SupervisorEvent::Stopped(name.to_string()));
            }
            Ok(())
        })
    }

    fn is_running<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SupervisorResult<bool>> {
        Box::pin(async move { Ok(self.lock().running.contains_key(name)) })
    }
}
