//! Cluster layout as supplied to `set_parameters`.
//!
//! A layout is a JSON array of node objects. Decoding problems (wrong JSON
//! types, missing IP fields) are `Malformed`; a layout that decodes but
//! breaks a topology rule is `InvalidLayout`. Either is reported before any
//! role is started.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::node::{Node, NodeSet};
use crate::role::Role;

#[derive(Debug, Deserialize)]
struct RawNode {
    public_ip: String,
    private_ip: String,
    #[serde(default)]
    cloud: Option<String>,
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    ssh_key: Option<String>,
    #[serde(default)]
    disk: Option<String>,
    #[serde(alias = "roles")]
    jobs: Vec<String>,
}

/// A decoded, not yet validated, layout.
#[derive(Debug, Clone)]
pub struct Layout {
    nodes: Vec<Node>,
}

impl Layout {
    /// Decode a layout from a JSON value, or from a JSON-encoded string
    /// holding the array.
    pub fn parse(value: &Value) -> StateResult<Self> {
        let owned;
        let value = match value {
            Value::String(text) => {
                owned = serde_json::from_str::<Value>(text)
                    .map_err(|e| StateError::Malformed(format!("layout is not JSON: {e}")))?;
                &owned
            }
            other => other,
        };

        let entries = value
            .as_array()
            .ok_or_else(|| StateError::Malformed("layout must be an array of nodes".to_string()))?;

        let mut nodes = Vec::with_capacity(entries.len());
        for (idx, entry) in entries.iter().enumerate() {
            let raw: RawNode = serde_json::from_value(entry.clone())
                .map_err(|e| StateError::Malformed(format!("node {idx}: {e}")))?;
            let mut jobs = Vec::with_capacity(raw.jobs.len());
            for name in &raw.jobs {
                jobs.push(name.parse::<Role>()?);
            }
            let mut node = Node {
                public_ip: raw.public_ip,
                private_ip: raw.private_ip,
                cloud: raw.cloud.unwrap_or_else(|| "cloud1".to_string()),
                instance_id: raw.instance_id.unwrap_or_default(),
                ssh_key: raw.ssh_key.unwrap_or_default(),
                disk: raw.disk,
                jobs: Vec::new(),
            };
            for role in jobs {
                node.add_role(role);
            }
            nodes.push(node);
        }
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Apply every topology rule and build the node set.
    ///
    /// `local_ip` must name one of the nodes (by private or public IP):
    /// a controller cannot run a layout it is not part of.
    pub fn validate(self, local_ip: &str, multi_master: bool) -> StateResult<NodeSet> {
        if self.nodes.is_empty() {
            return Err(StateError::InvalidLayout("layout has no nodes".to_string()));
        }
        for node in &self.nodes {
            check_address(&node.private_ip)?;
            check_address(&node.public_ip)?;
        }

        let set = NodeSet::new(self.nodes)?;
        set.assignment().check_topology(multi_master)?;

        if set.find_by_ip(local_ip).is_none() {
            return Err(StateError::InvalidLayout(format!(
                "this node ({local_ip}) is not part of the layout"
            )));
        }

        debug!(nodes = set.len(), "layout validated");
        Ok(set)
    }
}

fn check_address(addr: &str) -> StateResult<()> {
    let ok = !addr.is_empty()
        && addr
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == ':');
    if ok {
        Ok(())
    } else {
        Err(StateError::InvalidLayout(format!("bad address {addr:?}")))
    }
}
