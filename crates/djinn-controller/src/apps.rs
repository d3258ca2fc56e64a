//! Application lifecycle and load balancer routing.
//!
//! The coordination store holds the authoritative app records; every
//! mutation here reloads them under the state lock before changing
//! anything. Routing is only pushed to the proxies when a record differs
//! from what they were last given.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info, warn};

use djinn_coord::{ScaleDirection, WriteOutcome};
use djinn_proxy::{BuiltinService, RegenOutcome};
use djinn_state::apps::{RESERVED_PORTS, instance_owner, listener_owner, ports_on_host};
use djinn_state::{AppRecord, NodeSet, PortAllocator, Role, StateError};

use crate::context::{ClusterState, Djinn};
use crate::error::{ControllerError, ControllerResult};

/// Owner reported for ports held by platform services.
const PLATFORM_OWNER: &str = "platform";

impl Djinn {
    /// Deploy an application: claim its listener ports and place its
    /// minimum number of instances on the application hosts.
    ///
    /// Starting an app that already has a record returns that record.
    pub async fn start_app(
        &self,
        app_id: &str,
        language: &str,
        threadsafe: bool,
    ) -> ControllerResult<AppRecord> {
        check_app_id(app_id)?;
        let record = {
            let mut state = self.lock_state().await;
            let wanted = state
                .params
                .as_ref()
                .ok_or(ControllerError::NotInitialized)?
                .min_app_instances
                .max(1) as usize;
            self.refresh_apps(&mut state).await?;
            if let Some(existing) = state.apps.get(app_id) {
                debug!(app = %app_id, "app already deployed");
                existing.clone()
            } else {
                let app = place_new_app(&state, app_id, language, threadsafe, wanted)?;
                if let WriteOutcome::Abandoned = self.store().write_app(&app).await? {
                    warn!(app = %app_id, "app record not persisted; routing locally only");
                }
                state.apps.insert(app_id.to_string(), app.clone());
                info!(
                    app = %app_id,
                    http = app.http_port,
                    https = app.https_port,
                    instances = app.instances.len(),
                    "app deployed"
                );
                app
            }
        };
        self.route_app(&record).await?;
        Ok(record)
    }

    /// Remove an application. Returns whether it existed.
    pub async fn stop_app(&self, app_id: &str) -> ControllerResult<bool> {
        check_app_id(app_id)?;
        let existed = {
            let mut state = self.lock_state().await;
            self.refresh_apps(&mut state).await?;
            let existed = state.apps.remove(app_id).is_some();
            self.store().delete_app(app_id).await?;
            existed
        };
        self.unroute_app(app_id).await?;
        if existed {
            info!(app = %app_id, "app stopped");
        }
        Ok(existed)
    }

    /// Whether the app has a record with at least one instance.
    pub async fn is_app_running(&self, app_id: &str) -> ControllerResult<bool> {
        Ok(self
            .store()
            .read_app(app_id)
            .await?
            .is_some_and(|app| !app.instances.is_empty()))
    }

    /// Move an app to new public http and https ports.
    ///
    /// Fails without touching the record if either port is held by
    /// another app's listener, by a platform service, or by an instance
    /// running on a load balancer where the new listener would bind.
    pub async fn relocate_app(&self, app_id: &str, http_port: u16, https_port: u16) -> ControllerResult<AppRecord> {
        let record = {
            let mut state = self.lock_state().await;
            self.refresh_apps(&mut state).await?;
            let current = state
                .apps
                .get(app_id)
                .cloned()
                .ok_or_else(|| ControllerError::AppNotFound(app_id.to_string()))?;

            if http_port == https_port {
                return Err(ControllerError::PortTaken {
                    port: https_port,
                    owner: app_id.to_string(),
                });
            }
            let balancers: Vec<&str> = state
                .nodes
                .iter()
                .filter(|n| n.is_load_balancer())
                .map(|n| n.private_ip.as_str())
                .collect();
            for port in [http_port, https_port] {
                if RESERVED_PORTS.contains(&port) {
                    return Err(ControllerError::PortTaken {
                        port,
                        owner: PLATFORM_OWNER.to_string(),
                    });
                }
                if let Some(owner) = listener_owner(state.apps.values(), port, app_id)
                    .or_else(|| instance_owner(state.apps.values(), &balancers, port))
                {
                    return Err(ControllerError::PortTaken {
                        port,
                        owner: owner.to_string(),
                    });
                }
            }

            let mut updated = current;
            updated.http_port = http_port;
            updated.https_port = https_port;
            self.store().write_app(&updated).await?;
            state.apps.insert(app_id.to_string(), updated.clone());
            info!(app = %app_id, http = http_port, https = https_port, "app relocated");
            updated
        };
        self.route_app(&record).await?;
        Ok(record)
    }

    /// Register an application-server instance with the load balancer.
    /// Registering one that is already known succeeds.
    pub async fn add_routing_for_appserver(&self, app_id: &str, ip: &str, port: u16) -> ControllerResult<()> {
        let record = {
            let mut state = self.lock_state().await;
            self.refresh_apps(&mut state).await?;
            let app = state
                .apps
                .get_mut(app_id)
                .ok_or_else(|| ControllerError::AppNotFound(app_id.to_string()))?;
            match app.add_instance(ip, port) {
                Ok(()) => {}
                Err(StateError::PortInUse { .. }) => {
                    debug!(app = %app_id, %ip, port, "instance already routed");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            let app = app.clone();
            self.store().write_app(&app).await?;
            app
        };
        self.route_app(&record).await?;
        Ok(())
    }

    /// Take an instance out of rotation. Returns whether it was routed.
    pub async fn remove_appserver_from_haproxy(&self, app_id: &str, ip: &str, port: u16) -> ControllerResult<bool> {
        let record = {
            let mut state = self.lock_state().await;
            self.refresh_apps(&mut state).await?;
            let app = state
                .apps
                .get_mut(app_id)
                .ok_or_else(|| ControllerError::AppNotFound(app_id.to_string()))?;
            if !app.remove_instance(ip, port) {
                return Ok(false);
            }
            let app = app.clone();
            self.store().write_app(&app).await?;
            app
        };
        self.route_app(&record).await?;
        Ok(true)
    }

    /// Queue a scale request for the head node. Returns the request id.
    pub async fn request_scaling(&self, app_id: &str, direction: &str) -> ControllerResult<String> {
        let direction: ScaleDirection = direction.parse()?;
        if self.store().read_app(app_id).await?.is_none() {
            return Err(ControllerError::AppNotFound(app_id.to_string()));
        }
        Ok(self.store().push_scale_request(app_id, direction).await?)
    }

    // ── Routing ────────────────────────────────────────────────────

    pub(crate) async fn refresh_apps(&self, state: &mut ClusterState) -> ControllerResult<()> {
        state.apps = self.store().read_apps().await?;
        Ok(())
    }

    async fn is_local_load_balancer(&self) -> bool {
        self.lock_state()
            .await
            .nodes
            .find_by_ip(self.local_ip())
            .is_some_and(|n| n.is_load_balancer())
    }

    /// Push an app's routing to the local proxies if this node balances
    /// load and the record changed since the last push. Returns whether a
    /// regeneration was attempted.
    ///
    /// Must not be called with the state lock held.
    pub(crate) async fn route_app(&self, app: &AppRecord) -> ControllerResult<bool> {
        if !self.is_local_load_balancer().await {
            return Ok(false);
        }
        let mut routes = self.lock_routes().await;
        if routes.apps.get(&app.app_id) == Some(app) {
            return Ok(false);
        }
        match self.proxy().sync_app(app).await? {
            RegenOutcome::RolledBack(reason) | RegenOutcome::Invalid(reason) => {
                warn!(app = %app.app_id, %reason, "routing not applied; retried next pass");
                routes.apps.remove(&app.app_id);
            }
            RegenOutcome::Unchanged | RegenOutcome::Reloaded => {
                routes.apps.insert(app.app_id.clone(), app.clone());
            }
        }
        Ok(true)
    }

    pub(crate) async fn unroute_app(&self, app_id: &str) -> ControllerResult<()> {
        if !self.is_local_load_balancer().await {
            return Ok(());
        }
        let mut routes = self.lock_routes().await;
        self.proxy().remove_app(app_id).await?;
        routes.apps.remove(app_id);
        Ok(())
    }

    /// Route every app in `apps` and drop routing for apps that are gone,
    /// including blocks left on disk by an earlier controller process.
    pub(crate) async fn route_all_apps(&self, apps: &BTreeMap<String, AppRecord>) -> ControllerResult<()> {
        for app in apps.values() {
            self.route_app(app).await?;
        }
        let mut stale: BTreeSet<String> = {
            let routes = self.lock_routes().await;
            routes.apps.keys().filter(|id| !apps.contains_key(*id)).cloned().collect()
        };
        stale.extend(self.proxy().stale_apps(apps).await?);
        for app_id in stale {
            info!(app = %app_id, "dropping routing for removed app");
            self.unroute_app(&app_id).await?;
        }
        Ok(())
    }

    /// Point the platform service listeners at the nodes holding each
    /// service's role.
    pub(crate) async fn route_services(&self, nodes: &NodeSet) -> ControllerResult<()> {
        let wanted = service_hosts(nodes);
        let mut routes = self.lock_routes().await;
        for (service, hosts) in wanted {
            if routes.services.get(&service) == Some(&hosts) {
                continue;
            }
            match self.proxy().sync_service(service, &hosts).await? {
                RegenOutcome::RolledBack(reason) | RegenOutcome::Invalid(reason) => {
                    warn!(%service, %reason, "service routing not applied");
                    routes.services.remove(&service);
                }
                RegenOutcome::Unchanged | RegenOutcome::Reloaded => {
                    debug!(%service, hosts = hosts.len(), "service routing synced");
                    routes.services.insert(service, hosts);
                }
            }
        }
        Ok(())
    }
}

/// Private IPs holding each platform service.
pub(crate) fn service_hosts(nodes: &NodeSet) -> BTreeMap<BuiltinService, Vec<String>> {
    let holders = |pred: &dyn Fn(Role) -> bool| -> Vec<String> {
        nodes
            .iter()
            .filter(|n| n.jobs.iter().any(|r| pred(*r)))
            .map(|n| n.private_ip.clone())
            .collect()
    };
    BuiltinService::ALL
        .into_iter()
        .map(|service| {
            let hosts = match service {
                BuiltinService::Datastore | BuiltinService::UserAppServer => holders(&|r| r.is_database()),
                BuiltinService::Search => holders(&|r| r == Role::Search),
                BuiltinService::TaskQueue => holders(&|r| r.is_task_queue()),
                BuiltinService::Blobstore => holders(&|r| r == Role::ApplicationHost),
            };
            (service, hosts)
        })
        .collect()
}

fn place_new_app(
    state: &ClusterState,
    app_id: &str,
    language: &str,
    threadsafe: bool,
    wanted: usize,
) -> ControllerResult<AppRecord> {
    let mut claimed: BTreeSet<u16> = state.apps.values().flat_map(|a| a.listen_ports()).collect();
    let http = PortAllocator::HTTP.next(&claimed)?;
    claimed.insert(http);
    let https = PortAllocator::HTTPS.next(&claimed)?;
    claimed.insert(https);
    let proxy = PortAllocator::APP_PROXY.next(&claimed)?;

    let mut app = AppRecord::new(app_id, language, threadsafe).with_ports(http, https, proxy);
    let hosts: Vec<String> = state
        .nodes
        .app_hosts()
        .into_iter()
        .map(|n| n.private_ip.clone())
        .collect();
    if hosts.is_empty() {
        warn!(app = %app_id, "no application hosts; app has no instances yet");
        return Ok(app);
    }
    for i in 0..wanted {
        let host = &hosts[i % hosts.len()];
        let used = ports_on_host(state.apps.values().chain(std::iter::once(&app)), host);
        let port = PortAllocator::INSTANCE.next(&used)?;
        app.add_instance(host, port)?;
    }
    Ok(app)
}

fn check_app_id(app_id: &str) -> ControllerResult<()> {
    let ok = !app_id.is_empty()
        && app_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ControllerError::InvalidAppId(app_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::testutil::{Harness, layout_one, layout_three, options};

    async fn deployed(layout: serde_json::Value) -> Harness {
        let h = Harness::new("10.0.0.1");
        h.djinn.set_parameters(&layout, &options()).await.unwrap();
        h
    }

    #[tokio::test]
    async fn start_app_claims_ports_and_places_instances() {
        let h = deployed(layout_one()).await;
        let app = h.djinn.start_app("guestbook", "python27", true).await.unwrap();
        assert_eq!((app.http_port, app.https_port, app.proxy_port), (8080, 4380, 10000));
        assert_eq!(app.instances.len(), 1);
        assert_eq!(app.instances[0].host, "10.0.0.1");
        assert_eq!(app.instances[0].port, 20000);
        assert!(h.djinn.is_app_running("guestbook").await.unwrap());

        let cfg = std::fs::read_to_string(h.djinn.proxy().generator().haproxy_config_path()).unwrap();
        assert!(cfg.contains("gae_guestbook"));
        assert!(h.djinn.proxy().generator().nginx_site_path("guestbook").exists());

        let second = h.djinn.start_app("blog", "go", false).await.unwrap();
        assert_eq!((second.http_port, second.https_port, second.proxy_port), (8081, 4381, 10001));
        assert_eq!(second.instances[0].port, 20001);
    }

    #[tokio::test]
    async fn start_app_is_idempotent() {
        let h = deployed(layout_one()).await;
        let first = h.djinn.start_app("guestbook", "python27", true).await.unwrap();
        let regens = h.djinn.proxy().generator().regeneration_count();
        let again = h.djinn.start_app("guestbook", "python27", true).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(h.djinn.proxy().generator().regeneration_count(), regens);
    }

    #[tokio::test]
    async fn instances_spread_over_app_hosts() {
        let h = Harness::new("10.0.0.1");
        let mut opts = options();
        opts["min_app_instances"] = json!("3");
        h.djinn.set_parameters(&layout_three(), &opts).await.unwrap();
        let app = h.djinn.start_app("guestbook", "python27", true).await.unwrap();
        let hosts: Vec<&str> = app.instances.iter().map(|i| i.host.as_str()).collect();
        assert_eq!(hosts, vec!["10.0.0.2", "10.0.0.3", "10.0.0.2"]);
        assert_eq!(app.instances[2].port, 20001);
    }

    #[tokio::test]
    async fn bad_app_id_rejected() {
        let h = deployed(layout_one()).await;
        let err = h.djinn.start_app("../etc", "python27", true).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidAppId(_)));
    }

    #[tokio::test]
    async fn relocate_onto_taken_port_leaves_record_alone() {
        let h = deployed(layout_one()).await;
        let a = h.djinn.start_app("a", "python27", true).await.unwrap();
        h.djinn.start_app("b", "python27", true).await.unwrap();

        let err = h.djinn.relocate_app("b", a.http_port, 4500).await.unwrap_err();
        assert!(err.to_string().contains("port is already in use"));
        assert!(err.to_string().contains("belongs to a"));
        let b = h.djinn.store().read_app("b").await.unwrap().unwrap();
        assert_eq!((b.http_port, b.https_port), (8081, 4381));

        let err = h.djinn.relocate_app("b", 8888, 4500).await.unwrap_err();
        assert!(matches!(err, ControllerError::PortTaken { port: 8888, .. }));

        let moved = h.djinn.relocate_app("b", 9000, 4500).await.unwrap();
        assert_eq!((moved.http_port, moved.https_port), (9000, 4500));
        let site = std::fs::read_to_string(h.djinn.proxy().generator().nginx_site_path("b")).unwrap();
        assert!(site.contains("9000"));
    }

    #[tokio::test]
    async fn relocate_onto_an_instance_port_on_the_load_balancer() {
        let h = deployed(layout_one()).await;
        let a = h.djinn.start_app("a", "python27", true).await.unwrap();
        h.djinn.start_app("b", "python27", true).await.unwrap();
        let instance = a.instances[0].clone();
        assert_eq!(instance.host, "10.0.0.1");

        let err = h.djinn.relocate_app("b", instance.port, 4500).await.unwrap_err();
        assert!(
            matches!(&err, ControllerError::PortTaken { port, owner } if *port == instance.port && owner == "a"),
            "{err}"
        );
        let err = h.djinn.relocate_app("a", 9000, instance.port).await.unwrap_err();
        assert!(matches!(err, ControllerError::PortTaken { .. }));
        let b = h.djinn.store().read_app("b").await.unwrap().unwrap();
        assert_eq!((b.http_port, b.https_port), (8081, 4381));
    }

    #[tokio::test]
    async fn instance_ports_elsewhere_do_not_block_relocation() {
        let h = deployed(layout_three()).await;
        let a = h.djinn.start_app("a", "python27", true).await.unwrap();
        let instance = a.instances[0].clone();
        assert_ne!(instance.host, "10.0.0.1");

        let moved = h.djinn.relocate_app("a", instance.port, 4500).await.unwrap();
        assert_eq!(moved.http_port, instance.port);
    }

    #[tokio::test]
    async fn relocate_unknown_app() {
        let h = deployed(layout_one()).await;
        let err = h.djinn.relocate_app("ghost", 9000, 4500).await.unwrap_err();
        assert!(matches!(err, ControllerError::AppNotFound(_)));
    }

    #[tokio::test]
    async fn failed_proxy_reload_is_not_an_error() {
        let h = deployed(layout_one()).await;
        h.djinn.start_app("guestbook", "python27", true).await.unwrap();
        let path = h.djinn.proxy().generator().haproxy_config_path();
        let before = std::fs::read_to_string(&path).unwrap_or_default();

        h.proxy_ctl.fail_reloads(true);
        h.djinn.add_routing_for_appserver("guestbook", "10.0.0.1", 20005).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap_or_default(), before);
        let app = h.djinn.store().read_app("guestbook").await.unwrap().unwrap();
        assert!(app.instances.iter().any(|i| i.port == 20005));

        // The next routing pass applies what the failed reload could not.
        h.proxy_ctl.fail_reloads(false);
        h.djinn.route_all_apps(&h.djinn.apps().await).await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("10.0.0.1:20005"));
    }

    #[tokio::test]
    async fn appserver_routing_added_and_removed() {
        let h = deployed(layout_one()).await;
        h.djinn.start_app("guestbook", "python27", true).await.unwrap();

        h.djinn.add_routing_for_appserver("guestbook", "10.0.0.1", 20005).await.unwrap();
        h.djinn.add_routing_for_appserver("guestbook", "10.0.0.1", 20005).await.unwrap();
        let app = h.djinn.store().read_app("guestbook").await.unwrap().unwrap();
        assert_eq!(app.instances.len(), 2);
        let cfg = std::fs::read_to_string(h.djinn.proxy().generator().haproxy_config_path()).unwrap();
        assert!(cfg.contains("10.0.0.1:20005"));

        assert!(h.djinn.remove_appserver_from_haproxy("guestbook", "10.0.0.1", 20005).await.unwrap());
        assert!(!h.djinn.remove_appserver_from_haproxy("guestbook", "10.0.0.1", 20005).await.unwrap());
        let cfg = std::fs::read_to_string(h.djinn.proxy().generator().haproxy_config_path()).unwrap();
        assert!(!cfg.contains("10.0.0.1:20005"));
    }

    #[tokio::test]
    async fn stop_app_removes_record_and_routing() {
        let h = deployed(layout_one()).await;
        h.djinn.start_app("guestbook", "python27", true).await.unwrap();
        assert!(h.djinn.stop_app("guestbook").await.unwrap());
        assert!(!h.djinn.stop_app("guestbook").await.unwrap());
        assert!(!h.djinn.is_app_running("guestbook").await.unwrap());
        assert!(!h.djinn.proxy().generator().nginx_site_path("guestbook").exists());
        let blocks = h.djinn.proxy().generator().services().await.unwrap();
        assert!(!blocks.iter().any(|b| b == "gae_guestbook"));
    }

    #[tokio::test]
    async fn scale_requests_need_a_known_app() {
        let h = deployed(layout_one()).await;
        let err = h.djinn.request_scaling("ghost", "up").await.unwrap_err();
        assert!(matches!(err, ControllerError::AppNotFound(_)));
        h.djinn.start_app("guestbook", "python27", true).await.unwrap();
        h.djinn.request_scaling("guestbook", "scale_up").await.unwrap();
        let pending = h.djinn.store().scale_requests().await.unwrap();
        assert_eq!(pending["guestbook"].len(), 1);
        assert!(h.djinn.request_scaling("guestbook", "sideways").await.is_err());
    }

    #[test]
    fn services_follow_roles() {
        let nodes = djinn_state::Layout::parse(&layout_three())
            .unwrap()
            .validate("10.0.0.1", false)
            .unwrap();
        let hosts = service_hosts(&nodes);
        assert_eq!(hosts[&BuiltinService::Datastore], vec!["10.0.0.1"]);
        assert_eq!(hosts[&BuiltinService::Blobstore], vec!["10.0.0.2", "10.0.0.3"]);
        assert!(hosts[&BuiltinService::Search].is_empty());
    }
}
