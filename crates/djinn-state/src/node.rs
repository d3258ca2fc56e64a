//! Cluster members and the ordered node registry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::role::Role;

// ── Node ───────────────────────────────────────────────────────────

/// One machine in the deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub public_ip: String,
    pub private_ip: String,
    #[serde(default)]
    pub cloud: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub ssh_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
    /// Assigned roles, in assignment order, without duplicates.
    #[serde(alias = "roles")]
    pub jobs: Vec<Role>,
}

impl Node {
    pub fn new(public_ip: &str, private_ip: &str, jobs: Vec<Role>) -> StateResult<Self> {
        let mut node = Self {
            public_ip: public_ip.to_string(),
            private_ip: private_ip.to_string(),
            cloud: "cloud1".to_string(),
            instance_id: format!("i-{}", private_ip.replace('.', "")),
            ssh_key: String::new(),
            disk: None,
            jobs: Vec::new(),
        };
        for role in jobs {
            node.add_role(role);
        }
        node.check()?;
        Ok(node)
    }

    pub fn with_cloud(mut self, cloud: &str, instance_id: &str) -> Self {
        self.cloud = cloud.to_string();
        self.instance_id = instance_id.to_string();
        self
    }

    pub fn with_ssh_key(mut self, ssh_key: &str) -> Self {
        self.ssh_key = ssh_key.to_string();
        self
    }

    pub fn with_disk(mut self, disk: &str) -> Self {
        self.disk = Some(disk.to_string());
        self
    }

    /// Validate per-node invariants.
    pub fn check(&self) -> StateResult<()> {
        if self.private_ip.trim().is_empty() || self.public_ip.trim().is_empty() {
            return Err(StateError::InvalidLayout(
                "node is missing a public or private IP".to_string(),
            ));
        }
        if self.jobs.is_empty() {
            return Err(StateError::InvalidLayout(format!(
                "node {} has no roles",
                self.private_ip
            )));
        }
        Ok(())
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.jobs.contains(&role)
    }

    /// Add a role. Adding a real role to an `open` node replaces `open`.
    /// Returns false if the node already had it.
    pub fn add_role(&mut self, role: Role) -> bool {
        if self.has_role(role) {
            return false;
        }
        if role != Role::Open {
            self.jobs.retain(|r| *r != Role::Open);
        }
        self.jobs.push(role);
        true
    }

    /// Remove a role. A node left with nothing becomes `open`.
    /// Returns false if the node did not have it.
    pub fn remove_role(&mut self, role: Role) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|r| *r != role);
        let removed = self.jobs.len() != before;
        if self.jobs.is_empty() {
            self.jobs.push(Role::Open);
        }
        removed
    }

    pub fn is_open(&self) -> bool {
        self.has_role(Role::Open)
    }

    pub fn is_db_master(&self) -> bool {
        self.has_role(Role::DatabaseMaster)
    }

    pub fn is_load_balancer(&self) -> bool {
        self.has_role(Role::LoadBalancer)
    }

    pub fn is_app_host(&self) -> bool {
        self.has_role(Role::ApplicationHost)
    }

    pub fn is_shadow(&self) -> bool {
        self.has_role(Role::Shadow)
    }

    /// Jobs sorted into start order.
    pub fn roles_in_start_order(&self) -> Vec<Role> {
        let mut roles = self.jobs.clone();
        Role::start_order(&mut roles);
        roles
    }
}

// ── NodeSet ────────────────────────────────────────────────────────

/// Ordered collection of every known node. The first node is the head
/// node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct NodeSet {
    nodes: Vec<Node>,
}

impl NodeSet {
    pub fn new(nodes: Vec<Node>) -> StateResult<Self> {
        let mut set = Self::default();
        for node in nodes {
            set.insert(node)?;
        }
        Ok(set)
    }

    /// Append a node. Fails on a duplicate private IP or a role-less node.
    pub fn insert(&mut self, node: Node) -> StateResult<()> {
        node.check()?;
        if self.get(&node.private_ip).is_some() {
            return Err(StateError::InvalidLayout(format!(
                "duplicate private IP {}",
                node.private_ip
            )));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Replace the node with the same private IP, or append it.
    pub fn upsert(&mut self, node: Node) -> StateResult<()> {
        node.check()?;
        match self.get_mut(&node.private_ip) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
        Ok(())
    }

    pub fn remove(&mut self, private_ip: &str) -> Option<Node> {
        let idx = self.nodes.iter().position(|n| n.private_ip == private_ip)?;
        Some(self.nodes.remove(idx))
    }

    pub fn get(&self, private_ip: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.private_ip == private_ip)
    }

    pub fn get_mut(&mut self, private_ip: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.private_ip == private_ip)
    }

    /// Find a node by either of its addresses.
    pub fn find_by_ip(&self, ip: &str) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| n.private_ip == ip || n.public_ip == ip)
    }

    pub fn head(&self) -> Option<&Node> {
        self.nodes.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn as_slice(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn with_role(&self, role: Role) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.has_role(role)).collect()
    }

    pub fn app_hosts(&self) -> Vec<&Node> {
        self.with_role(Role::ApplicationHost)
    }

    pub fn load_balancers(&self) -> Vec<&Node> {
        self.with_role(Role::LoadBalancer)
    }

    pub fn db_master(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.is_db_master())
    }

    pub fn public_ips(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.public_ip.clone()).collect()
    }

    pub fn private_ips(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.private_ip.clone()).collect()
    }

    pub fn assignment(&self) -> RoleAssignment {
        RoleAssignment::from_nodes(self)
    }
}

// ── Role assignment ────────────────────────────────────────────────

/// Role name to the private IPs holding it, in node order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment(pub BTreeMap<Role, Vec<String>>);

impl RoleAssignment {
    pub fn from_nodes(nodes: &NodeSet) -> Self {
        let mut map: BTreeMap<Role, Vec<String>> = BTreeMap::new();
        for node in nodes.iter() {
            for role in &node.jobs {
                map.entry(*role).or_default().push(node.private_ip.clone());
            }
        }
        Self(map)
    }

    pub fn holders(&self, role: Role) -> &[String] {
        self.0.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check the singleton rules: at most one database master unless
    /// multi-master is enabled, and a database slave only alongside a
    /// master.
    pub fn check_topology(&self, multi_master: bool) -> StateResult<()> {
        let masters = self.holders(Role::DatabaseMaster).len();
        if masters > 1 && !multi_master {
            return Err(StateError::InvalidLayout(format!(
                "{masters} database-master nodes but multi-master is not enabled"
            )));
        }
        if masters == 0 && !self.holders(Role::DatabaseSlave).is_empty() {
            return Err(StateError::InvalidLayout(
                "database-slave nodes without a database-master".to_string(),
            ));
        }
        if self.holders(Role::TaskQueueMaster).len() > 1 {
            return Err(StateError::InvalidLayout(
                "more than one task-queue-master".to_string(),
            ));
        }
        Ok(())
    }
}
