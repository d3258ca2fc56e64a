//! Getting a deployment into the controller: `set_parameters`, crash
//! recovery, and explicit role changes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use djinn_coord::WriteOutcome;
use djinn_state::{DeploymentParams, Layout, Node, Role, StateError};

use crate::context::{Djinn, is_head_of};
use crate::error::{ControllerError, ControllerResult};
use crate::phase::Phase;
use crate::provider::PeerNotifier;

/// Which peers took the parameters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanOutReport {
    pub reached: Vec<String>,
    pub unreachable: Vec<String>,
}

impl Djinn {
    /// Accept the deployment: validate the options and the layout, adopt
    /// them, and (on the head node) persist them and hand them to every
    /// other node.
    ///
    /// Nothing is started or written unless everything validates.
    pub async fn set_parameters(&self, layout: &Value, options: &Value) -> ControllerResult<()> {
        let options_map = decode_options(options)?;
        let params = DeploymentParams::from_options(&options_map)?;
        let nodes = Layout::parse(layout)?.validate(self.local_ip(), params.multi_master)?;
        let head = is_head_of(&nodes, self.local_ip());

        {
            let mut state = self.lock_state().await;
            if head {
                self.store().write_params(&params).await?;
                for node in nodes.iter() {
                    if let WriteOutcome::Abandoned = self.store().write_job_data(node).await? {
                        warn!(node = %node.private_ip, "job data not persisted; next pass retries");
                    }
                }
                self.store().write_ips(nodes.private_ips()).await?;
                if self.store().deployment_id().await?.is_none() {
                    let id = new_deployment_id();
                    self.store().set_deployment_id(&id).await?;
                    info!(deployment_id = %id, "deployment id assigned");
                }
            }
            state.nodes = nodes.clone();
            state.params = Some(params);
            state.ips_stamp = None;
        }
        if self.phase() == Phase::Initializing {
            self.set_phase(Phase::LoadingRoles);
        }
        info!(nodes = nodes.len(), head, "deployment parameters accepted");

        if head && nodes.len() > 1 {
            let targets: Vec<Node> = nodes
                .iter()
                .filter(|n| n.private_ip != self.local_ip() && n.public_ip != self.local_ip())
                .cloned()
                .collect();
            tokio::spawn(fan_out(self.peers().clone(), targets, layout.clone(), options.clone()));
        }
        Ok(())
    }

    /// Adopt the deployment a previous process of this node was running,
    /// if the coordination store has one. Returns whether it did.
    pub async fn recover(&self) -> ControllerResult<bool> {
        let Some(params) = self.store().read_params().await? else {
            debug!("no deployment parameters in the store");
            return Ok(false);
        };
        let Some(own) = self.store().read_job_data(self.local_ip()).await? else {
            debug!("no job data for this node in the store");
            return Ok(false);
        };
        let (nodes, _) = self.read_node_set().await?;
        let apps = self.store().read_apps().await?;
        {
            let mut state = self.lock_state().await;
            state.params = Some(params);
            state.nodes = nodes;
            state.apps = apps;
            state.ips_stamp = None;
        }
        self.set_phase(Phase::LoadingRoles);
        info!(roles = ?own.jobs, "recovered deployment from the coordination store");
        Ok(true)
    }

    /// Add roles to nodes. Unknown addresses join as new nodes.
    pub async fn start_roles_on_nodes(
        &self,
        roles_to_nodes: &BTreeMap<String, Vec<String>>,
    ) -> ControllerResult<()> {
        let mut wanted = Vec::new();
        for (name, ips) in roles_to_nodes {
            let role: Role = name.parse()?;
            for ip in ips {
                wanted.push((role, ip.clone()));
            }
        }

        let mut state = self.lock_state().await;
        let multi_master = state
            .params
            .as_ref()
            .ok_or(ControllerError::NotInitialized)?
            .multi_master;
        let mut nodes = state.nodes.clone();
        let mut touched = BTreeSet::new();
        for (role, ip) in wanted {
            let private = match nodes.find_by_ip(&ip) {
                Some(node) => node.private_ip.clone(),
                None => {
                    nodes.insert(Node::new(&ip, &ip, vec![role])?)?;
                    ip.clone()
                }
            };
            if let Some(node) = nodes.get_mut(&private) {
                node.add_role(role);
            }
            touched.insert(private);
        }
        nodes.assignment().check_topology(multi_master)?;

        for ip in &touched {
            if let Some(node) = nodes.get(ip) {
                self.store().write_job_data(node).await?;
            }
        }
        self.store().write_ips(nodes.private_ips()).await?;
        info!(nodes = ?touched, "roles added");
        state.nodes = nodes;
        Ok(())
    }

    /// Take a role away from a node. Removing a role the node does not
    /// hold succeeds.
    pub async fn remove_role(&self, node_ip: &str, role: &str) -> ControllerResult<()> {
        let role: Role = role.parse()?;
        let mut state = self.lock_state().await;
        if state.params.is_none() {
            return Err(ControllerError::NotInitialized);
        }
        let private = state
            .nodes
            .find_by_ip(node_ip)
            .map(|n| n.private_ip.clone())
            .ok_or_else(|| StateError::NodeNotFound(node_ip.to_string()))?;
        let Some(node) = state.nodes.get_mut(&private) else {
            return Err(StateError::NodeNotFound(node_ip.to_string()).into());
        };
        if !node.remove_role(role) {
            debug!(node = %private, %role, "role was not assigned");
            return Ok(());
        }
        let node = node.clone();
        self.store().write_job_data(&node).await?;
        self.store().write_ips(state.nodes.private_ips()).await?;
        info!(node = %private, %role, "role removed");
        Ok(())
    }
}

/// Push the layout to every target at once. Unreachable nodes are logged
/// and left out; nobody waits on them.
pub async fn fan_out(
    peers: Arc<dyn PeerNotifier>,
    targets: Vec<Node>,
    layout: Value,
    options: Value,
) -> FanOutReport {
    let mut tasks = JoinSet::new();
    for node in targets {
        let peers = peers.clone();
        let layout = layout.clone();
        let options = options.clone();
        tasks.spawn(async move {
            let result = peers.push_parameters(&node, &layout, &options).await;
            (node.private_ip, result)
        });
    }

    let mut report = FanOutReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((ip, Ok(()))) => {
                debug!(node = %ip, "parameters delivered");
                report.reached.push(ip);
            }
            Ok((ip, Err(e))) => {
                warn!(node = %ip, error = %e, "node excluded from parameter push");
                report.unreachable.push(ip);
            }
            Err(e) => warn!(error = %e, "parameter push task failed"),
        }
    }
    report.reached.sort();
    report.unreachable.sort();
    info!(reached = report.reached.len(), unreachable = report.unreachable.len(), "parameter fan-out done");
    report
}

/// Options arrive as an object or as a JSON string holding one.
fn decode_options(options: &Value) -> ControllerResult<serde_json::Map<String, Value>> {
    let parsed;
    let value = match options {
        Value::String(text) => {
            parsed = serde_json::from_str::<Value>(text)
                .map_err(|e| StateError::Malformed(format!("options are not JSON: {e}")))?;
            &parsed
        }
        other => other,
    };
    match value {
        Value::Object(map) => Ok(map.clone()),
        _ => Err(StateError::Malformed("options must be an object".to_string()).into()),
    }
}

fn new_deployment_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
