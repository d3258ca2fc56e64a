//! ClusterStore — the controller's schema on top of the coordination client.
//!
//! Values are JSON. Multi-path updates are not transactional: each
//! method is safe to repeat, and a half-finished registration is finished
//! by the next one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use djinn_state::{AppRecord, DeploymentParams, Node};

use crate::client::{CoordinationClient, WriteOutcome};
use crate::error::{CoordError, CoordResult};
use crate::paths;

/// The membership list and its change stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpsRecord {
    pub ips: Vec<String>,
    /// Milliseconds since the epoch; strictly increases with each write.
    pub last_updated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl ScaleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleDirection::Up => "up",
            ScaleDirection::Down => "down",
        }
    }
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScaleDirection {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" | "scale_up" => Ok(ScaleDirection::Up),
            "down" | "scale_down" => Ok(ScaleDirection::Down),
            other => Err(CoordError::Invalid(format!("unknown scale direction {other:?}"))),
        }
    }
}

/// A pending request recorded by an application monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleRequest {
    #[serde(default)]
    pub id: String,
    pub app_id: String,
    pub direction: ScaleDirection,
    pub requested_by: String,
    pub requested_at: u64,
}

pub struct ClusterStore {
    client: Arc<CoordinationClient>,
    request_seq: AtomicU64,
}

impl ClusterStore {
    pub fn new(client: Arc<CoordinationClient>) -> Self {
        Self {
            client,
            request_seq: AtomicU64::new(0),
        }
    }

    pub fn client(&self) -> &Arc<CoordinationClient> {
        &self.client
    }

    // ── Membership ─────────────────────────────────────────────────

    pub async fn read_ips(&self) -> CoordResult<Option<IpsRecord>> {
        self.client.read_json(&paths::ips_path()).await
    }

    /// Replace the membership list and advance its stamp.
    pub async fn write_ips(&self, ips: Vec<String>) -> CoordResult<IpsRecord> {
        let previous = self.read_ips().await?.map(|r| r.last_updated).unwrap_or(0);
        let record = IpsRecord {
            ips,
            last_updated: djinn_core::epoch_millis().max(previous + 1),
        };
        if let WriteOutcome::Abandoned = self.client.write_json(&paths::ips_path(), &record).await? {
            warn!(nodes = record.ips.len(), "membership list not persisted this pass");
        }
        Ok(record)
    }

    /// Register a node: placeholder, live marker, job data, then the
    /// done-loading flag, in that order. The flag is left untouched if the
    /// job data could not be written, so nobody reads stale jobs as final.
    pub async fn register_node(&self, node: &Node, done_loading: bool) -> CoordResult<WriteOutcome> {
        let ip = node.private_ip.as_str();
        match self.client.create(&paths::node_path(ip), "", false).await {
            Ok(_) | Err(CoordError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
        self.mark_live(ip).await?;
        let outcome = self.write_job_data(node).await?;
        if outcome == WriteOutcome::Abandoned {
            return Ok(outcome);
        }
        let flag = self.set_done_loading(ip, done_loading).await?;
        debug!(node = %ip, done_loading, "node registered");
        Ok(flag)
    }

    /// (Re)create this session's ephemeral live marker for `ip`.
    pub async fn mark_live(&self, ip: &str) -> CoordResult<()> {
        let path = paths::live_path(ip);
        let owner = self.client.identity().to_string();
        match self.client.create(&path, &owner, true).await {
            Ok(_) => Ok(()),
            Err(CoordError::NodeExists(_)) => {
                // May belong to a session from before a restart; take it over.
                match self.client.delete(&path).await {
                    Ok(()) | Err(CoordError::NoNode(_)) => {}
                    Err(e) => return Err(e),
                }
                self.client.create(&path, &owner, true).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn is_live(&self, ip: &str) -> CoordResult<bool> {
        self.client.exists(&paths::live_path(ip)).await
    }

    pub async fn write_job_data(&self, node: &Node) -> CoordResult<WriteOutcome> {
        self.client
            .write_json(&paths::job_data_path(&node.private_ip), node)
            .await
    }

    pub async fn read_job_data(&self, ip: &str) -> CoordResult<Option<Node>> {
        self.client.read_json(&paths::job_data_path(ip)).await
    }

    /// Job data for every registered node, keyed by private IP.
    pub async fn read_all_job_data(&self) -> CoordResult<BTreeMap<String, Node>> {
        let mut nodes = BTreeMap::new();
        for ip in self.registered_ips().await? {
            if let Some(node) = self.read_job_data(&ip).await? {
                nodes.insert(ip, node);
            }
        }
        Ok(nodes)
    }

    pub async fn registered_ips(&self) -> CoordResult<Vec<String>> {
        match self.client.children(&paths::nodes_root()).await {
            Ok(names) => Ok(names),
            Err(CoordError::NoNode(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn set_done_loading(&self, ip: &str, done: bool) -> CoordResult<WriteOutcome> {
        let value = if done { "true" } else { "false" };
        self.client.write(&paths::done_loading_path(ip), value).await
    }

    pub async fn is_done_loading(&self, ip: &str) -> CoordResult<bool> {
        match self.client.get(&paths::done_loading_path(ip)).await {
            Ok(value) => Ok(value == "true"),
            Err(CoordError::NoNode(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Forget a node entirely.
    pub async fn remove_node(&self, ip: &str) -> CoordResult<()> {
        info!(node = %ip, "removing node from the store");
        self.client.delete_recursive(&paths::node_path(ip)).await
    }

    // ── Deployment ─────────────────────────────────────────────────

    pub async fn read_params(&self) -> CoordResult<Option<DeploymentParams>> {
        self.client.read_json(&paths::params_path()).await
    }

    pub async fn write_params(&self, params: &DeploymentParams) -> CoordResult<WriteOutcome> {
        self.client.write_json(&paths::params_path(), params).await
    }

    pub async fn deployment_id(&self) -> CoordResult<Option<String>> {
        match self.client.get(&paths::deployment_id_path()).await {
            Ok(id) => Ok(Some(id)),
            Err(CoordError::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn set_deployment_id(&self, id: &str) -> CoordResult<WriteOutcome> {
        self.client.write(&paths::deployment_id_path(), id).await
    }

    // ── Applications ───────────────────────────────────────────────

    pub async fn write_app(&self, app: &AppRecord) -> CoordResult<WriteOutcome> {
        self.client.write_json(&paths::app_path(&app.app_id), app).await
    }

    pub async fn read_app(&self, app_id: &str) -> CoordResult<Option<AppRecord>> {
        self.client.read_json(&paths::app_path(app_id)).await
    }

    pub async fn read_apps(&self) -> CoordResult<BTreeMap<String, AppRecord>> {
        let names = match self.client.children(&paths::apps_root()).await {
            Ok(names) => names,
            Err(CoordError::NoNode(_)) => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };
        let mut apps = BTreeMap::new();
        for name in names {
            if let Some(app) = self.read_app(&name).await? {
                apps.insert(name, app);
            }
        }
        Ok(apps)
    }

    pub async fn delete_app(&self, app_id: &str) -> CoordResult<()> {
        match self.client.delete(&paths::app_path(app_id)).await {
            Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ── Scale requests ─────────────────────────────────────────────

    /// Record a scale request and return its id.
    pub async fn push_scale_request(
        &self,
        app_id: &str,
        direction: ScaleDirection,
    ) -> CoordResult<String> {
        let seq = self.request_seq.fetch_add(1, Ordering::SeqCst);
        let now = djinn_core::epoch_millis();
        let id = format!("{now:013}-{seq:04}-{}", self.client.identity());
        let request = ScaleRequest {
            id: id.clone(),
            app_id: app_id.to_string(),
            direction,
            requested_by: self.client.identity().to_string(),
            requested_at: now,
        };
        let value = serde_json::to_string(&request).map_err(|e| CoordError::Invalid(e.to_string()))?;
        self.client
            .create(&paths::scale_request_path(app_id, &id), &value, false)
            .await?;
        debug!(app = %app_id, %direction, %id, "scale request recorded");
        Ok(id)
    }

    /// Pending requests grouped by app, oldest first.
    pub async fn scale_requests(&self) -> CoordResult<BTreeMap<String, Vec<ScaleRequest>>> {
        let apps = match self.client.children(&paths::scale_root()).await {
            Ok(apps) => apps,
            Err(CoordError::NoNode(_)) => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };
        let mut pending = BTreeMap::new();
        for app_id in apps {
            let mut ids = match self.client.children(&paths::scale_app_path(&app_id)).await {
                Ok(ids) => ids,
                Err(CoordError::NoNode(_)) => continue,
                Err(e) => return Err(e),
            };
            ids.sort();
            let mut requests = Vec::with_capacity(ids.len());
            for id in ids {
                let path = paths::scale_request_path(&app_id, &id);
                if let Some(mut request) = self.client.read_json::<ScaleRequest>(&path).await? {
                    request.id = id;
                    requests.push(request);
                }
            }
            if !requests.is_empty() {
                pending.insert(app_id, requests);
            }
        }
        Ok(pending)
    }

    pub async fn clear_scale_request(&self, app_id: &str, request_id: &str) -> CoordResult<()> {
        match self
            .client
            .delete(&paths::scale_request_path(app_id, request_id))
            .await
        {
            Ok(()) | Err(CoordError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
