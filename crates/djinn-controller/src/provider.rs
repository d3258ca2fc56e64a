//! Collaborator seams: cloud instance lifecycle and peer controllers.

use std::sync::Mutex;

use serde_json::Value;
use tracing::debug;

use djinn_state::{Node, Role};

use crate::BoxFuture;
use crate::error::{ControllerError, ControllerResult};

/// Spawns and terminates machines.
pub trait InstanceProvider: Send + Sync {
    /// Bring up `count` machines. They join as `open` nodes.
    fn spawn<'a>(&'a self, count: usize) -> BoxFuture<'a, ControllerResult<Vec<Node>>>;

    fn terminate<'a>(&'a self, private_ips: &'a [String]) -> BoxFuture<'a, ControllerResult<()>>;
}

/// A fixed set of machines. Cannot spawn; terminating is a no-op.
#[derive(Debug, Default)]
pub struct StaticProvider;

impl InstanceProvider for StaticProvider {
    fn spawn<'a>(&'a self, count: usize) -> BoxFuture<'a, ControllerResult<Vec<Node>>> {
        Box::pin(async move {
            Err(ControllerError::Provider(format!(
                "static deployment cannot spawn {count} machine(s)"
            )))
        })
    }

    fn terminate<'a>(&'a self, private_ips: &'a [String]) -> BoxFuture<'a, ControllerResult<()>> {
        Box::pin(async move {
            debug!(nodes = ?private_ips, "static deployment, nothing to terminate");
            Ok(())
        })
    }
}

/// Hands out machines from a list given up front.
pub struct PooledProvider {
    pool: Mutex<Vec<(String, String)>>,
}

impl PooledProvider {
    /// `machines` are `(public_ip, private_ip)` pairs.
    pub fn new(machines: Vec<(String, String)>) -> Self {
        Self {
            pool: Mutex::new(machines),
        }
    }

    pub fn remaining(&self) -> usize {
        self.pool.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl InstanceProvider for PooledProvider {
    fn spawn<'a>(&'a self, count: usize) -> BoxFuture<'a, ControllerResult<Vec<Node>>> {
        Box::pin(async move {
            let taken: Vec<(String, String)> = {
                let mut pool = self.pool.lock().unwrap_or_else(|p| p.into_inner());
                if pool.len() < count {
                    return Err(ControllerError::Provider(format!(
                        "asked for {count} machine(s), {} left",
                        pool.len()
                    )));
                }
                pool.drain(..count).collect()
            };
            taken
                .into_iter()
                .map(|(public, private)| Node::new(&public, &private, vec![Role::Open]).map_err(Into::into))
                .collect()
        })
    }

    fn terminate<'a>(&'a self, private_ips: &'a [String]) -> BoxFuture<'a, ControllerResult<()>> {
        Box::pin(async move {
            debug!(nodes = ?private_ips, "pooled machines released");
            Ok(())
        })
    }
}

/// Other controllers, reached over the control plane.
pub trait PeerNotifier: Send + Sync {
    /// Hand `node` the deployment's layout and options.
    fn push_parameters<'a>(
        &'a self,
        node: &'a Node,
        layout: &'a Value,
        options: &'a Value,
    ) -> BoxFuture<'a, ControllerResult<()>>;
}

/// For single-node deployments and tests.
#[derive(Debug, Default)]
pub struct NoPeers;

impl PeerNotifier for NoPeers {
    fn push_parameters<'a>(
        &'a self,
        node: &'a Node,
        _layout: &'a Value,
        _options: &'a Value,
    ) -> BoxFuture<'a, ControllerResult<()>> {
        Box::pin(async move {
            Err(ControllerError::PeerUnreachable {
                node: node.private_ip.clone(),
                reason: "no peer transport configured".to_string(),
            })
        })
    }
}
