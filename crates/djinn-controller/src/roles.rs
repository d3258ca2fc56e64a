//! Role handlers.
//!
//! Every role kind maps to a handler with start, stop and is-running
//! capabilities. Most roles are one or more supervised services; the
//! load balancer also owns the HAProxy process, and `open` has nothing
//! to run.
//!
//! Starting is idempotent. A service whose ports already accept
//! connections is left alone, and the supervisor treats a start of a
//! running service as a success.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use djinn_core::DjinnConfig;
use djinn_core::config::ServiceOverride;
use djinn_proxy::{ProxySync, RegenOutcome};
use djinn_state::{AppRecord, Role};
use djinn_supervisor::probe::POLL_INTERVAL;
use djinn_supervisor::{ServiceSpec, ServiceSupervisor, is_port_open, wait_for_port};

use crate::BoxFuture;
use crate::error::{ControllerError, ControllerResult};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// What a handler works with.
#[derive(Clone)]
pub struct RoleEnv {
    pub supervisor: Arc<dyn ServiceSupervisor>,
    pub proxy: Arc<ProxySync>,
    /// Address probed for service ports.
    pub host: String,
    /// Probe ports before starting and wait for them after. Off when the
    /// supervisor does not run real processes.
    pub probe_ports: bool,
    pub port_wait: Duration,
}

pub trait RoleHandler: Send + Sync {
    fn role(&self) -> Role;

    fn start<'a>(&'a self, env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<()>>;

    fn stop<'a>(&'a self, env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<()>>;

    fn is_running<'a>(&'a self, env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<bool>>;
}

// ── Service catalog ────────────────────────────────────────────────

/// Which services each role runs, with configured overrides applied.
#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    djinnd_bin: PathBuf,
    coordination_port: u16,
    coordination_data_dir: PathBuf,
    nginx_bin: PathBuf,
    overrides: HashMap<String, ServiceOverride>,
}

impl ServiceCatalog {
    pub fn new(config: &DjinnConfig) -> Self {
        let djinnd_bin = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("/usr/local/bin/djinnd"));
        Self {
            djinnd_bin,
            coordination_port: config.coordination.port,
            coordination_data_dir: config.coordination.data_dir.clone(),
            nginx_bin: config.proxy.nginx_bin.clone(),
            overrides: config.services.clone(),
        }
    }

    /// Services for `role`, in start order. `table` names the datastore
    /// backend.
    pub fn services_for(&self, role: Role, table: &str) -> Vec<ServiceSpec> {
        let mut specs = match role {
            Role::CoordinationService => vec![
                ServiceSpec::new(
                    "djinn-coordinator",
                    vec![
                        self.djinnd_bin.display().to_string(),
                        "coordinator".into(),
                        "--port".into(),
                        self.coordination_port.to_string(),
                        "--data-dir".into(),
                        self.coordination_data_dir.display().to_string(),
                    ],
                )
                .with_port(self.coordination_port),
            ],
            Role::DatabaseMaster | Role::DatabaseSlave => vec![
                ServiceSpec::new(
                    "appscale-datastore",
                    args(&["/usr/bin/appscale-datastore", "--port", "4000", "--type", table]),
                )
                .with_port(4000),
                ServiceSpec::new("appscale-uaserver", args(&["/usr/bin/appscale-uaserver", "--port", "4342"]))
                    .with_port(4342),
            ],
            Role::TaskQueueMaster | Role::TaskQueueSlave => vec![
                ServiceSpec::new(
                    "appscale-taskqueue",
                    args(&["/usr/bin/appscale-taskqueue", "--port", "17447"]),
                )
                .with_port(17447),
            ],
            Role::Memcache => vec![
                ServiceSpec::new(
                    "memcached",
                    args(&["/usr/bin/memcached", "-m", "64", "-p", "11211", "-u", "root"]),
                )
                .with_port(11211),
            ],
            Role::Search => vec![
                ServiceSpec::new("appscale-search", args(&["/usr/bin/appscale-search", "--port", "53424"]))
                    .with_port(53424),
            ],
            Role::LoadBalancer => vec![ServiceSpec::new(
                "nginx",
                vec![
                    self.nginx_bin.display().to_string(),
                    "-c".into(),
                    "/etc/nginx/nginx.conf".into(),
                ],
            )],
            Role::ApplicationHost => vec![
                ServiceSpec::new("appscale-appmanager", args(&["/usr/bin/appscale-appmanager", "--port", "17445"]))
                    .with_port(17445),
                ServiceSpec::new("appscale-blobstore", args(&["/usr/bin/appscale-blobstore", "--port", "6107"]))
                    .with_port(6107),
            ],
            Role::Shadow => vec![
                ServiceSpec::new("appscale-admin", args(&["/usr/bin/appscale-admin", "--port", "17441"]))
                    .with_port(17441),
            ],
            Role::Open => Vec::new(),
        };

        if let Some(over) = self.overrides.get(role.as_str())
            && let Some(first) = specs.first_mut()
        {
            first.command = over.command.clone();
            if let Some(port) = over.port {
                first.ports = vec![port];
            }
            for (k, v) in &over.env {
                first.env.insert(k.clone(), v.clone());
            }
        }
        specs
    }

    /// One application-server process.
    pub fn instance_spec(&self, app: &AppRecord, port: u16, max_memory_mb: u32) -> ServiceSpec {
        let mut command = match self.overrides.get("app-instance") {
            Some(over) => over.command.clone(),
            None => vec!["/usr/bin/appscale-appserver".to_string()],
        };
        command.extend([
            "--app_id".to_string(),
            app.app_id.clone(),
            "--port".to_string(),
            port.to_string(),
            "--language".to_string(),
            app.language.clone(),
        ]);
        ServiceSpec::new(&instance_service_name(&app.app_id, port), command)
            .with_port(port)
            .with_env("APPSCALE_APP_ID", &app.app_id)
            .with_max_memory(max_memory_mb)
    }
}

pub fn instance_service_name(app_id: &str, port: u16) -> String {
    format!("app___{app_id}-{port}")
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

// ── Handlers ───────────────────────────────────────────────────────

/// A role that is nothing more than its services.
pub struct ServiceRole {
    role: Role,
    services: Vec<ServiceSpec>,
}

impl ServiceRole {
    pub fn new(role: Role, services: Vec<ServiceSpec>) -> Self {
        Self { role, services }
    }

    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }
}

async fn ports_open(env: &RoleEnv, spec: &ServiceSpec) -> bool {
    if spec.ports.is_empty() {
        return false;
    }
    for port in &spec.ports {
        if !is_port_open(&env.host, *port, PROBE_TIMEOUT).await {
            return false;
        }
    }
    true
}

/// Start one service unless it is already listening, then wait for its
/// ports.
pub async fn start_service(env: &RoleEnv, spec: &ServiceSpec) -> ControllerResult<()> {
    if env.probe_ports && ports_open(env, spec).await {
        debug!(service = %spec.name, ports = ?spec.ports, "already listening");
        return Ok(());
    }
    env.supervisor.start(spec).await?;
    if env.probe_ports {
        for port in &spec.ports {
            wait_for_port(&env.host, *port, env.port_wait, POLL_INTERVAL).await?;
        }
    }
    Ok(())
}

impl RoleHandler for ServiceRole {
    fn role(&self) -> Role {
        self.role
    }

    fn start<'a>(&'a self, env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<()>> {
        Box::pin(async move {
            for spec in &self.services {
                start_service(env, spec).await.map_err(|e| ControllerError::RoleFailed {
                    role: self.role,
                    reason: format!("{}: {e}", spec.name),
                })?;
            }
            info!(role = %self.role, services = self.services.len(), "role started");
            Ok(())
        })
    }

    fn stop<'a>(&'a self, env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<()>> {
        Box::pin(async move {
            for spec in self.services.iter().rev() {
                env.supervisor.stop(&spec.name).await.map_err(|e| ControllerError::RoleFailed {
                    role: self.role,
                    reason: format!("stopping {}: {e}", spec.name),
                })?;
            }
            info!(role = %self.role, "role stopped");
            Ok(())
        })
    }

    fn is_running<'a>(&'a self, env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<bool>> {
        Box::pin(async move {
            for spec in &self.services {
                if !env.supervisor.is_running(&spec.name).await? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
    }
}

/// Nginx under the supervisor, plus HAProxy driven through the proxy
/// generator so graceful reloads keep working.
pub struct LoadBalancerRole {
    inner: ServiceRole,
}

impl RoleHandler for LoadBalancerRole {
    fn role(&self) -> Role {
        Role::LoadBalancer
    }

    fn start<'a>(&'a self, env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<()>> {
        Box::pin(async move {
            let outcome = env.proxy.generator().start_haproxy().await?;
            if let RegenOutcome::RolledBack(reason) = outcome {
                return Err(ControllerError::RoleFailed {
                    role: Role::LoadBalancer,
                    reason: format!("haproxy did not take its configuration: {reason}"),
                });
            }
            debug!(?outcome, "haproxy configuration in place");
            self.inner.start(env).await
        })
    }

    fn stop<'a>(&'a self, env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<()>> {
        // HAProxy keeps serving until the node goes away; only nginx is stopped.
        self.inner.stop(env)
    }

    fn is_running<'a>(&'a self, env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<bool>> {
        self.inner.is_running(env)
    }
}

pub struct OpenRole;

impl RoleHandler for OpenRole {
    fn role(&self) -> Role {
        Role::Open
    }

    fn start<'a>(&'a self, _env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn stop<'a>(&'a self, _env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<()>> {
        Box::pin(async { Ok(()) })
    }

    fn is_running<'a>(&'a self, _env: &'a RoleEnv) -> BoxFuture<'a, ControllerResult<bool>> {
        Box::pin(async { Ok(true) })
    }
}

/// The handler for a role kind.
pub fn handler_for(role: Role, catalog: &ServiceCatalog, table: &str) -> Box<dyn RoleHandler> {
    match role {
        Role::Open => Box::new(OpenRole),
        Role::LoadBalancer => Box::new(LoadBalancerRole {
            inner: ServiceRole::new(role, catalog.services_for(role, table)),
        }),
        Role::CoordinationService
        | Role::DatabaseMaster
        | Role::DatabaseSlave
        | Role::TaskQueueMaster
        | Role::TaskQueueSlave
        | Role::Memcache
        | Role::Search
        | Role::ApplicationHost
        | Role::Shadow => Box::new(ServiceRole::new(role, catalog.services_for(role, table))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use djinn_core::config::ProxyConfig;
    use djinn_proxy::{DryRunController, ProxyGenerator};
    use djinn_supervisor::DryRunSupervisor;
    use tokio::net::TcpListener;

    fn env(dir: &tempfile::TempDir, supervisor: Arc<DryRunSupervisor>, probe_ports: bool) -> RoleEnv {
        let config = ProxyConfig {
            haproxy_dir: dir.path().join("haproxy"),
            nginx_dir: dir.path().join("nginx"),
            reload_cooldown_ms: 1,
            ..ProxyConfig::default()
        };
        let generator = Arc::new(ProxyGenerator::new(&config, Arc::new(DryRunController::new())));
        RoleEnv {
            supervisor,
            proxy: Arc::new(ProxySync::new(generator, "127.0.0.1")),
            host: "127.0.0.1".into(),
            probe_ports,
            port_wait: Duration::from_millis(200),
        }
    }

    fn catalog() -> ServiceCatalog {
        ServiceCatalog::new(&DjinnConfig::for_node("10.0.0.1", "203.0.113.1"))
    }

    #[test]
    fn default_services_and_ports() {
        let c = catalog();
        let db = c.services_for(Role::DatabaseMaster, "cassandra");
        assert_eq!(db[0].ports, vec![4000]);
        assert!(db[0].command.contains(&"cassandra".to_string()));
        assert_eq!(c.services_for(Role::Memcache, "")[0].ports, vec![11211]);
        assert!(c.services_for(Role::Open, "").is_empty());
        for role in Role::ALL {
            for spec in c.services_for(role, "cassandra") {
                spec.validate().unwrap();
            }
        }
    }

    #[test]
    fn override_replaces_first_service() {
        let mut config = DjinnConfig::for_node("10.0.0.1", "203.0.113.1");
        config.services.insert(
            "memcache".into(),
            ServiceOverride {
                command: vec!["/opt/memcached".into(), "-p".into(), "11311".into()],
                port: Some(11311),
                env: HashMap::new(),
            },
        );
        let specs = ServiceCatalog::new(&config).services_for(Role::Memcache, "");
        assert_eq!(specs[0].command[0], "/opt/memcached");
        assert_eq!(specs[0].ports, vec![11311]);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_reverses() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(DryRunSupervisor::new());
        let env = env(&dir, sup.clone(), false);
        let handler = handler_for(Role::ApplicationHost, &catalog(), "cassandra");

        handler.start(&env).await.unwrap();
        handler.start(&env).await.unwrap();
        assert!(handler.is_running(&env).await.unwrap());
        assert_eq!(sup.events().len(), 2);

        handler.stop(&env).await.unwrap();
        assert!(!handler.is_running(&env).await.unwrap());
        assert!(sup.running().is_empty());
    }

    #[tokio::test]
    async fn listening_service_is_not_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(DryRunSupervisor::new());
        let env = env(&dir, sup.clone(), true);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let spec = ServiceSpec::new("already-up", vec!["/bin/true".into()]).with_port(port);
        start_service(&env, &spec).await.unwrap();
        assert!(sup.events().is_empty());
    }

    #[tokio::test]
    async fn silent_service_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(DryRunSupervisor::new());
        let env = env(&dir, sup, true);
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let handler = ServiceRole::new(
            Role::Memcache,
            vec![ServiceSpec::new("memcached", vec!["/bin/true".into()]).with_port(port)],
        );
        let err = handler.start(&env).await.unwrap_err();
        assert!(matches!(err, ControllerError::RoleFailed { role: Role::Memcache, .. }));
        assert!(err.to_string().contains("not reachable"));
    }

    #[tokio::test]
    async fn failed_start_names_the_role() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(DryRunSupervisor::new());
        sup.fail_starts_of("memcached");
        let env = env(&dir, sup, false);
        let err = handler_for(Role::Memcache, &catalog(), "")
            .start(&env)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("role memcache failed"));
    }

    #[tokio::test]
    async fn load_balancer_writes_haproxy_config() {
        let dir = tempfile::tempdir().unwrap();
        let sup = Arc::new(DryRunSupervisor::new());
        let env = env(&dir, sup.clone(), false);
        handler_for(Role::LoadBalancer, &catalog(), "").start(&env).await.unwrap();
        assert!(env.proxy.generator().haproxy_config_path().exists());
        assert_eq!(sup.running(), vec!["nginx"]);
    }
}
