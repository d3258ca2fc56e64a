//! Application instance records and port bookkeeping.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Ports owned by platform services; never handed to applications.
pub const RESERVED_PORTS: &[u16] = &[
    1080, 2181, 4000, 4342, 4343, 6106, 6107, 8888, 11211, 17441, 17442, 17443, 17444, 17445,
    17446, 17447, 53423, 53424,
];

/// One application-server process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AppInstance {
    /// Private IP of the hosting node.
    pub host: String,
    pub port: u16,
}

impl AppInstance {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A deployed application: its public listeners and its instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppRecord {
    pub app_id: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub threadsafe: bool,
    /// Nginx http listener.
    pub http_port: u16,
    /// Nginx https listener.
    pub https_port: u16,
    /// HAProxy listener that fans out to instances.
    pub proxy_port: u16,
    #[serde(default)]
    pub instances: Vec<AppInstance>,
}

impl AppRecord {
    pub fn new(app_id: &str, language: &str, threadsafe: bool) -> Self {
        Self {
            app_id: app_id.to_string(),
            language: language.to_string(),
            threadsafe,
            http_port: 0,
            https_port: 0,
            proxy_port: 0,
            instances: Vec::new(),
        }
    }

    pub fn with_ports(mut self, http_port: u16, https_port: u16, proxy_port: u16) -> Self {
        self.http_port = http_port;
        self.https_port = https_port;
        self.proxy_port = proxy_port;
        self
    }

    /// Listener ports this app claims on the load balancers.
    pub fn listen_ports(&self) -> [u16; 3] {
        [self.http_port, self.https_port, self.proxy_port]
    }

    pub fn add_instance(&mut self, host: &str, port: u16) -> StateResult<()> {
        if self.instances.iter().any(|i| i.host == host && i.port == port) {
            return Err(StateError::PortInUse {
                host: host.to_string(),
                port,
            });
        }
        self.instances.push(AppInstance::new(host, port));
        Ok(())
    }

    pub fn remove_instance(&mut self, host: &str, port: u16) -> bool {
        let before = self.instances.len();
        self.instances.retain(|i| !(i.host == host && i.port == port));
        self.instances.len() != before
    }

    /// Drop every instance on a host. Returns how many were removed.
    pub fn remove_host(&mut self, host: &str) -> usize {
        let before = self.instances.len();
        self.instances.retain(|i| i.host != host);
        before - self.instances.len()
    }

    pub fn instances_on(&self, host: &str) -> usize {
        self.instances.iter().filter(|i| i.host == host).count()
    }

    /// Host running the most instances of this app, ties broken by address.
    pub fn busiest_host(&self) -> Option<String> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for inst in &self.instances {
            *counts.entry(inst.host.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(host, _)| host.to_string())
    }
}

/// Which app, other than `except`, already listens on `port`.
pub fn listener_owner<'a>(
    apps: impl IntoIterator<Item = &'a AppRecord>,
    port: u16,
    except: &str,
) -> Option<&'a str> {
    apps.into_iter()
        .filter(|a| a.app_id != except)
        .find(|a| a.listen_ports().contains(&port))
        .map(|a| a.app_id.as_str())
}

/// The app with an instance bound to `port` on one of `hosts`.
pub fn instance_owner<'a>(
    apps: impl IntoIterator<Item = &'a AppRecord>,
    hosts: &[&str],
    port: u16,
) -> Option<&'a str> {
    apps.into_iter()
        .find(|a| {
            a.instances
                .iter()
                .any(|i| i.port == port && hosts.contains(&i.host.as_str()))
        })
        .map(|a| a.app_id.as_str())
}

/// Ports bound on `host` by any app's instances.
pub fn ports_on_host<'a>(apps: impl IntoIterator<Item = &'a AppRecord>, host: &str) -> BTreeSet<u16> {
    apps.into_iter()
        .flat_map(|a| a.instances.iter())
        .filter(|i| i.host == host)
        .map(|i| i.port)
        .collect()
}

/// Hands out the lowest free port at or above a starting point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAllocator {
    start: u16,
}

impl PortAllocator {
    /// HAProxy listeners, one per app.
    pub const APP_PROXY: PortAllocator = PortAllocator { start: 10000 };
    /// Application-server instances, per node.
    pub const INSTANCE: PortAllocator = PortAllocator { start: 20000 };
    /// Nginx http listeners, one per app.
    pub const HTTP: PortAllocator = PortAllocator { start: 8080 };
    /// Nginx https listeners, one per app.
    pub const HTTPS: PortAllocator = PortAllocator { start: 4380 };

    pub const fn starting_at(start: u16) -> Self {
        Self { start }
    }

    pub fn next(&self, used: &BTreeSet<u16>) -> StateResult<u16> {
        (self.start..=u16::MAX)
            .find(|p| !used.contains(p) && !RESERVED_PORTS.contains(p))
            .ok_or(StateError::PortsExhausted(self.start))
    }
}
