//! Head-node duties: reaping dead nodes and acting on scale requests.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use djinn_coord::ScaleDirection;
use djinn_state::apps::ports_on_host;
use djinn_state::{AppRecord, DeploymentParams, PortAllocator, Role};

use crate::context::{ClusterState, Djinn};
use crate::error::{ControllerError, ControllerResult};

/// One change made by the scaling sub-loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleAction {
    Added {
        app_id: String,
        host: String,
        port: u16,
        /// The host was given the application-host role for this.
        new_role: bool,
    },
    Removed {
        app_id: String,
        host: String,
        port: u16,
    },
}

impl ScaleAction {
    pub fn app_id(&self) -> &str {
        match self {
            ScaleAction::Added { app_id, .. } | ScaleAction::Removed { app_id, .. } => app_id,
        }
    }
}

impl Djinn {
    /// Remove nodes whose live marker is gone. A node is only reaped
    /// after its marker has been seen at least once, so nodes that are
    /// still booting are left alone. Returns the reaped addresses.
    pub async fn reap_dead_nodes(&self) -> ControllerResult<Vec<String>> {
        let mut dead = Vec::new();
        let rerouted: Vec<AppRecord> = {
            let mut state = self.lock_state().await;
            let others: Vec<String> = state
                .nodes
                .iter()
                .map(|n| n.private_ip.clone())
                .filter(|ip| ip != self.local_ip())
                .collect();
            for ip in others {
                if self.store().is_live(&ip).await? {
                    state.seen_live.insert(ip);
                } else if state.seen_live.contains(&ip) {
                    dead.push(ip);
                } else {
                    debug!(node = %ip, "no live marker yet");
                }
            }
            if dead.is_empty() {
                return Ok(dead);
            }

            self.refresh_apps(&mut state).await?;
            let mut touched = BTreeSet::new();
            for ip in &dead {
                warn!(node = %ip, "live marker expired; reaping node");
                state.nodes.remove(ip);
                state.seen_live.remove(ip);
                self.store().remove_node(ip).await?;
                for app in state.apps.values_mut() {
                    if app.remove_host(ip) > 0 {
                        touched.insert(app.app_id.clone());
                    }
                }
            }
            let mut rerouted = Vec::new();
            for app_id in touched {
                if let Some(app) = state.apps.get(&app_id) {
                    self.store().write_app(app).await?;
                    rerouted.push(app.clone());
                }
            }
            self.store().write_ips(state.nodes.private_ips()).await?;
            rerouted
        };

        if let Err(e) = self.provider().terminate(&dead).await {
            warn!(nodes = ?dead, error = %e, "could not release reaped machines");
        }
        for app in &rerouted {
            self.route_app(app).await?;
        }
        info!(nodes = ?dead, apps = rerouted.len(), "dead nodes reaped");
        Ok(dead)
    }

    /// Act on pending scale requests, holding the cluster-wide lock.
    pub async fn scaling_pass(&self) -> ControllerResult<Vec<ScaleAction>> {
        if self.store().scale_requests().await?.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.store().client().clone();
        client.lock_and_run(|| self.apply_scale_requests()).await
    }

    async fn apply_scale_requests(&self) -> ControllerResult<Vec<ScaleAction>> {
        let pending = self.store().scale_requests().await?;
        let mut actions = Vec::new();
        let mut reroute = Vec::new();
        {
            let mut state = self.lock_state().await;
            let params = state.params.clone().ok_or(ControllerError::NotInitialized)?;
            self.refresh_apps(&mut state).await?;
            let cooldown = Duration::from_secs(params.scaling_cooldown_secs);

            for (app_id, requests) in pending {
                if !state.apps.contains_key(&app_id) {
                    warn!(app = %app_id, requests = requests.len(), "dropping requests for unknown app");
                    for request in &requests {
                        self.store().clear_scale_request(&app_id, &request.id).await?;
                    }
                    continue;
                }
                if let Some(at) = state.last_scale.get(&app_id)
                    && at.elapsed() < cooldown
                {
                    debug!(app = %app_id, "in cooldown; requests stay queued");
                    continue;
                }

                let net: i64 = requests
                    .iter()
                    .map(|r| match r.direction {
                        ScaleDirection::Up => 1,
                        ScaleDirection::Down => -1,
                    })
                    .sum();
                let action = match net.cmp(&0) {
                    Ordering::Greater => self.scale_up(&mut state, &params, &app_id).await?,
                    Ordering::Less => self.scale_down(&mut state, &params, &app_id).await?,
                    Ordering::Equal => None,
                };
                for request in &requests {
                    self.store().clear_scale_request(&app_id, &request.id).await?;
                }
                if let Some(action) = action {
                    info!(?action, "scaled");
                    state.last_scale.insert(app_id.clone(), Instant::now());
                    if let Some(app) = state.apps.get(&app_id) {
                        reroute.push(app.clone());
                    }
                    actions.push(action);
                }
            }
        }

        for app in &reroute {
            self.route_app(app).await?;
        }
        Ok(actions)
    }

    async fn scale_up(
        &self,
        state: &mut ClusterState,
        params: &DeploymentParams,
        app_id: &str,
    ) -> ControllerResult<Option<ScaleAction>> {
        let count = state.apps.get(app_id).map_or(0, |a| a.instances.len());
        if count >= params.max_app_instances as usize {
            info!(app = %app_id, count, "already at max_app_instances");
            return Ok(None);
        }

        let Some((host, new_role)) = self.pick_host(state, params, app_id).await? else {
            warn!(app = %app_id, "no node can take another instance");
            return Ok(None);
        };
        if new_role {
            let node = match state.nodes.get_mut(&host) {
                Some(node) => {
                    node.add_role(Role::ApplicationHost);
                    node.clone()
                }
                None => return Ok(None),
            };
            self.store().write_job_data(&node).await?;
            self.store().write_ips(state.nodes.private_ips()).await?;
            info!(node = %host, "application-host role assigned");
        }

        let port = PortAllocator::INSTANCE.next(&ports_on_host(state.apps.values(), &host))?;
        let Some(app) = state.apps.get_mut(app_id) else {
            return Ok(None);
        };
        app.add_instance(&host, port)?;
        self.store().write_app(app).await?;
        Ok(Some(ScaleAction::Added {
            app_id: app_id.to_string(),
            host,
            port,
            new_role,
        }))
    }

    /// Where the next instance goes: an open node, a node without the
    /// application-host role, a freshly spawned node, or failing all
    /// those the least loaded application host.
    async fn pick_host(
        &self,
        state: &mut ClusterState,
        params: &DeploymentParams,
        app_id: &str,
    ) -> ControllerResult<Option<(String, bool)>> {
        if let Some(node) = state.nodes.iter().find(|n| n.is_open()) {
            return Ok(Some((node.private_ip.clone(), true)));
        }
        if let Some(node) = state.nodes.iter().find(|n| !n.is_app_host()) {
            return Ok(Some((node.private_ip.clone(), true)));
        }
        if params.autoscale && state.nodes.len() < params.max_machines as usize {
            match self.provider().spawn(1).await {
                Ok(spawned) => {
                    if let Some(node) = spawned.into_iter().next() {
                        let ip = node.private_ip.clone();
                        state.nodes.upsert(node)?;
                        info!(node = %ip, "spawned a node for scaling");
                        return Ok(Some((ip, true)));
                    }
                }
                Err(e) => warn!(error = %e, "could not spawn a node"),
            }
        }
        let app = state.apps.get(app_id);
        let least_loaded = state
            .nodes
            .app_hosts()
            .into_iter()
            .min_by_key(|n| (app.map_or(0, |a| a.instances_on(&n.private_ip)), n.private_ip.clone()))
            .map(|n| (n.private_ip.clone(), false));
        Ok(least_loaded)
    }

    async fn scale_down(
        &self,
        state: &mut ClusterState,
        params: &DeploymentParams,
        app_id: &str,
    ) -> ControllerResult<Option<ScaleAction>> {
        let Some(app) = state.apps.get_mut(app_id) else {
            return Ok(None);
        };
        if app.instances.len() <= params.min_app_instances.max(1) as usize {
            info!(app = %app_id, count = app.instances.len(), "already at min_app_instances");
            return Ok(None);
        }
        let Some(host) = app.busiest_host() else {
            return Ok(None);
        };
        let Some(port) = app.instances.iter().filter(|i| i.host == host).map(|i| i.port).max() else {
            return Ok(None);
        };
        app.remove_instance(&host, port);
        self.store().write_app(app).await?;
        Ok(Some(ScaleAction::Removed {
            app_id: app_id.to_string(),
            host,
            port,
        }))
    }
}
