//! Role reconciliation.
//!
//! Each pass compares the roles the registry assigns to this node with
//! the roles it is running, stops what is no longer wanted (reverse
//! precedence), starts what is missing (precedence order), then brings
//! application instances, load balancer routing and head-node duties in
//! line. Passes are serialized by the runtime lock; a pass that finds
//! nothing changed does no role work.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use djinn_state::{AppRecord, DeploymentParams, NodeSet, Role};

use crate::context::{Djinn, RoleRuntime, is_head_of};
use crate::error::{ControllerError, ControllerResult};
use crate::phase::{CrashRecord, Phase};
use crate::roles::{handler_for, instance_service_name, start_service};

/// Roles to stop and start to get from one set to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleDelta {
    /// In start order.
    pub start: Vec<Role>,
    /// In stop order.
    pub stop: Vec<Role>,
}

impl RoleDelta {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.stop.is_empty()
    }
}

pub fn role_delta(current: &BTreeSet<Role>, target: &[Role]) -> RoleDelta {
    let target: BTreeSet<Role> = target.iter().copied().collect();
    let mut start: Vec<Role> = target.difference(current).copied().collect();
    let mut stop: Vec<Role> = current.difference(&target).copied().collect();
    Role::start_order(&mut start);
    Role::stop_order(&mut stop);
    RoleDelta { start, stop }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// No deployment yet; nothing to do.
    NotInitialized,
    /// Roles already matched the registry.
    Unchanged,
    Converged { started: Vec<Role>, stopped: Vec<Role> },
}

impl Djinn {
    /// The registry's node set, in membership-list order, and the stamp
    /// of the membership list it was read with.
    pub(crate) async fn read_node_set(&self) -> ControllerResult<(NodeSet, Option<u64>)> {
        let record = self.store().read_ips().await?;
        let mut by_ip = self.store().read_all_job_data().await?;
        let listed = record.as_ref().map(|r| r.ips.clone()).unwrap_or_default();

        let mut ordered = Vec::with_capacity(by_ip.len());
        for ip in listed {
            if let Some(node) = by_ip.remove(&ip) {
                ordered.push(node);
            }
        }
        ordered.extend(by_ip.into_values());

        let mut nodes = NodeSet::default();
        for node in ordered {
            let ip = node.private_ip.clone();
            if let Err(e) = nodes.upsert(node) {
                warn!(node = %ip, error = %e, "ignoring unusable job data");
            }
        }
        Ok((nodes, record.map(|r| r.last_updated)))
    }

    /// Run one reconciliation pass.
    ///
    /// A role failure fails the pass; once `max_consecutive_failures`
    /// passes in a row have failed the error becomes fatal.
    pub async fn reconcile_once(&self) -> ControllerResult<PassOutcome> {
        if self.phase() == Phase::Initializing && !self.recover().await? {
            debug!("waiting for deployment parameters");
            return Ok(PassOutcome::NotInitialized);
        }

        let mut runtime = self.lock_runtime().await;
        let stamp = self.store().read_ips().await?.map(|r| r.last_updated);
        let fresh = {
            let state = self.lock_state().await;
            let within_bound = state
                .last_full_pass
                .is_some_and(|at| at.elapsed() < self.config().reconcile.staleness_bound());
            stamp.is_some() && stamp == state.ips_stamp && runtime.converged && within_bound
        };

        let outcome = if fresh {
            self.keep_alive().await?;
            PassOutcome::Unchanged
        } else {
            self.reconcile_roles(&mut runtime).await?
        };

        let (nodes, params, apps) = {
            let mut state = self.lock_state().await;
            self.refresh_apps(&mut state).await?;
            (state.nodes.clone(), state.params.clone(), state.apps.clone())
        };
        let Some(params) = params else {
            return Ok(outcome);
        };
        let local = nodes.find_by_ip(self.local_ip()).cloned();

        self.sync_local_instances(&mut runtime, &apps, &params).await;
        drop(runtime);

        if local.as_ref().is_some_and(|n| n.is_load_balancer()) {
            if let Err(e) = self.route_all_apps(&apps).await {
                warn!(error = %e, "app routing failed this pass");
            }
            if let Err(e) = self.route_services(&nodes).await {
                warn!(error = %e, "service routing failed this pass");
            }
        }

        if is_head_of(&nodes, self.local_ip()) {
            if let Err(e) = self.reap_dead_nodes().await {
                warn!(error = %e, "reaping failed this pass");
            }
            if let Err(e) = self.scaling_pass().await {
                warn!(error = %e, "scaling failed this pass");
            }
        }
        Ok(outcome)
    }

    async fn reconcile_roles(&self, runtime: &mut RoleRuntime) -> ControllerResult<PassOutcome> {
        let (stored, stamp) = self.read_node_set().await?;
        let (nodes, table) = {
            let state = self.lock_state().await;
            let nodes = if stored.is_empty() { state.nodes.clone() } else { stored };
            let table = state
                .params
                .as_ref()
                .map(|p| p.table.clone())
                .ok_or(ControllerError::NotInitialized)?;
            (nodes, table)
        };

        let local = nodes.find_by_ip(self.local_ip()).cloned();
        let target: Vec<Role> = match &local {
            Some(node) => node.jobs.clone(),
            None => {
                warn!(node = %self.local_ip(), "this node has no job data; keeping current roles");
                runtime.running.iter().copied().collect()
            }
        };
        let delta = role_delta(&runtime.running, &target);

        {
            let mut state = self.lock_state().await;
            state.nodes = nodes;
            state.ips_stamp = stamp;
            state.last_full_pass = Some(Instant::now());
        }

        if delta.is_empty() && runtime.converged {
            self.keep_alive().await?;
            return Ok(PassOutcome::Unchanged);
        }

        self.set_phase(self.phase().entering_pass());
        self.set_done_loading_flag(false);
        self.store().set_done_loading(self.local_ip(), false).await?;
        info!(start = ?delta.start, stop = ?delta.stop, "applying role changes");

        if let Err(e) = self.apply_delta(runtime, &delta, &table).await {
            runtime.converged = false;
            runtime.failures += 1;
            let limit = self.config().reconcile.max_consecutive_failures;
            if runtime.failures >= limit {
                error!(failures = runtime.failures, error = %e, "giving up on reconciliation");
                return Err(ControllerError::TooManyFailures {
                    count: runtime.failures,
                    last: e.to_string(),
                });
            }
            warn!(failures = runtime.failures, limit, error = %e, "reconciliation pass failed");
            return Err(e);
        }

        if let Some(node) = &local {
            self.store().register_node(node, true).await?;
        }
        runtime.failures = 0;
        runtime.converged = true;
        self.set_done_loading_flag(true);
        self.set_phase(Phase::DoneLoading);
        info!(roles = ?runtime.running, "roles converged");
        Ok(PassOutcome::Converged {
            started: delta.start,
            stopped: delta.stop,
        })
    }

    /// Stop, then start. `running` is updated role by role so a partial
    /// failure leaves an accurate picture.
    async fn apply_delta(&self, runtime: &mut RoleRuntime, delta: &RoleDelta, table: &str) -> ControllerResult<()> {
        for role in &delta.stop {
            handler_for(*role, self.catalog(), table).stop(self.env()).await?;
            runtime.running.remove(role);
        }
        for role in &delta.start {
            handler_for(*role, self.catalog(), table).start(self.env()).await?;
            runtime.running.insert(*role);
        }
        // Retry roles that were left half-started by an earlier pass.
        let pending: Vec<Role> = runtime.running.iter().copied().collect();
        for role in pending {
            let handler = handler_for(role, self.catalog(), table);
            if !handler.is_running(self.env()).await? {
                debug!(%role, "role not fully running, starting again");
                handler.start(self.env()).await?;
            }
        }
        Ok(())
    }

    async fn keep_alive(&self) -> ControllerResult<()> {
        if !self.store().is_live(self.local_ip()).await? {
            self.store().mark_live(self.local_ip()).await?;
            info!("live marker restored");
        }
        Ok(())
    }

    /// Start and stop application-server processes on this node to match
    /// the app records. Instance failures are logged, not fatal.
    async fn sync_local_instances(
        &self,
        runtime: &mut RoleRuntime,
        apps: &BTreeMap<String, AppRecord>,
        params: &DeploymentParams,
    ) {
        let hosting = runtime.running.contains(&Role::ApplicationHost);
        let mut wanted = BTreeSet::new();
        if hosting {
            for app in apps.values() {
                for inst in app.instances.iter().filter(|i| i.host == self.local_ip()) {
                    wanted.insert((app.app_id.clone(), inst.port));
                }
            }
        }

        let gone: Vec<(String, u16)> = runtime.instances.difference(&wanted).cloned().collect();
        for (app_id, port) in gone {
            let name = instance_service_name(&app_id, port);
            match self.env().supervisor.stop(&name).await {
                Ok(()) => {
                    info!(app = %app_id, port, "instance stopped");
                    runtime.instances.remove(&(app_id, port));
                }
                Err(e) => warn!(app = %app_id, port, error = %e, "failed to stop instance"),
            }
        }

        let missing: Vec<(String, u16)> = wanted.difference(&runtime.instances).cloned().collect();
        for (app_id, port) in missing {
            let Some(app) = apps.get(&app_id) else { continue };
            let spec = self.catalog().instance_spec(app, port, params.max_memory);
            match start_service(self.env(), &spec).await {
                Ok(()) => {
                    info!(app = %app_id, port, "instance started");
                    runtime.instances.insert((app_id, port));
                }
                Err(e) => warn!(app = %app_id, port, error = %e, "failed to start instance"),
            }
        }
    }

    /// Reconcile every interval until `shutdown` flips to true.
    ///
    /// Only a fatal error ends the loop early; it leaves a crash record
    /// behind first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> ControllerResult<()> {
        let mut ticker = tokio::time::interval(self.config().reconcile.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.config().reconcile.interval_secs, "reconciliation loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.reconcile_once().await {
                        Ok(PassOutcome::Converged { started, stopped }) => {
                            debug!(?started, ?stopped, "pass converged");
                        }
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => {
                            let record = CrashRecord::new(self.local_ip(), &e.to_string(), self.phase());
                            if let Err(write_err) = record.write(&self.config().reconcile.crash_record_path) {
                                error!(error = %write_err, "could not leave a crash record");
                            }
                            return Err(e);
                        }
                        Err(e) => warn!(error = %e, "pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reconciliation loop stopping");
                        return Ok(());
                    }
                }
            }
        }
    }
}
