//! HAProxy configuration text.
//!
//! One `listen` block per service or application. HAProxy has no include
//! directive, so the active file is the base template followed by every
//! block, assembled by the generator.

use std::collections::BTreeMap;
use std::time::Duration;

use djinn_state::AppInstance;

use crate::error::{ProxyError, ProxyResult};
use crate::policy::ConnectionPolicy;

/// Health check path sent to application servers.
pub const APP_HEALTH_CHECK: &str = "GET /_ah/health_check";

/// Port of the HAProxy statistics page.
pub const STATS_PORT: u16 = 1080;

/// One `listen` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenBlock {
    pub name: String,
    pub bind_ip: String,
    pub port: u16,
    pub policy: ConnectionPolicy,
    pub servers: Vec<AppInstance>,
    pub http_check: Option<String>,
}

impl ListenBlock {
    pub fn new(name: &str, bind_ip: &str, port: u16, policy: ConnectionPolicy) -> Self {
        Self {
            name: name.to_string(),
            bind_ip: bind_ip.to_string(),
            port,
            policy,
            servers: Vec::new(),
            http_check: None,
        }
    }

    pub fn with_servers(mut self, servers: impl IntoIterator<Item = AppInstance>) -> Self {
        self.servers = servers.into_iter().collect();
        self
    }

    pub fn with_http_check(mut self, check: &str) -> Self {
        self.http_check = Some(check.to_string());
        self
    }

    /// The block text, or `None` when there is nothing to route to.
    pub fn render(&self) -> Option<String> {
        if self.servers.is_empty() {
            return None;
        }
        let maxconn = self.policy.max_connections();
        let mut lines: Vec<String> = self
            .servers
            .iter()
            .map(|s| {
                let location = s.endpoint();
                format!("server {}-{location} {location} maxconn {maxconn} check", self.name)
            })
            .collect();
        lines.sort();
        lines.dedup();

        let mut out = format!("listen {}\n", self.name);
        out.push_str(&format!("  bind {}:{}\n", self.bind_ip, self.port));
        out.push_str("  balance roundrobin\n");
        out.push_str("  option forwardfor\n");
        if let Some(check) = &self.http_check {
            out.push_str(&format!("  option httpchk {check}\n"));
        }
        for line in lines {
            out.push_str("  ");
            out.push_str(&line);
            out.push('\n');
        }
        Some(out)
    }
}

/// Values for the `global` and `defaults` sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseTemplate {
    pub stats_socket: String,
    pub connect_timeout: Duration,
    pub client_timeout: Duration,
    pub server_timeout: Duration,
}

impl BaseTemplate {
    pub fn render(&self) -> String {
        format!(
            "global\n\
             \x20 maxconn 64000\n\
             \x20 ulimit-n 200000\n\
             \x20 stats socket {socket} mode 600 level admin\n\
             \x20 log 127.0.0.1 local0 info\n\
             \n\
             defaults\n\
             \x20 log global\n\
             \x20 mode http\n\
             \x20 option httplog\n\
             \x20 option dontlognull\n\
             \x20 option redispatch\n\
             \x20 retries 3\n\
             \x20 timeout connect {connect}ms\n\
             \x20 timeout client {client}ms\n\
             \x20 timeout server {server}ms\n\
             \n\
             listen stats\n\
             \x20 bind 0.0.0.0:{STATS_PORT}\n\
             \x20 stats enable\n\
             \x20 stats uri /\n",
            socket = self.stats_socket,
            connect = self.connect_timeout.as_millis(),
            client = self.client_timeout.as_millis(),
            server = self.server_timeout.as_millis(),
        )
    }
}

/// The `bind` port of a rendered block, if it has one.
pub fn bound_port(fragment: &str) -> Option<u16> {
    fragment.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("bind ")?;
        let addr = rest.split_whitespace().next()?;
        addr.rsplit(':').next()?.parse().ok()
    })
}

/// Assemble the active file from named fragments.
///
/// Two fragments binding the same port make the whole configuration
/// invalid. With no fragments the file still carries the stats listener.
pub fn assemble(base: &BaseTemplate, fragments: &BTreeMap<String, String>) -> ProxyResult<String> {
    let mut owners: BTreeMap<u16, &str> = BTreeMap::new();
    owners.insert(STATS_PORT, "stats");
    for (name, text) in fragments {
        if let Some(port) = bound_port(text)
            && let Some(first) = owners.insert(port, name)
        {
            return Err(ProxyError::DuplicatePort {
                port,
                first: first.to_string(),
                second: name.clone(),
            });
        }
    }
    let mut out = base.render();
    for text in fragments.values() {
        out.push('\n');
        out.push_str(text.trim_end());
        out.push('\n');
    }
    Ok(out)
}
