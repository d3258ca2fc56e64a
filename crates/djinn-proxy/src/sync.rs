//! Application and service state to proxy configuration.
//!
//! `ProxySync` knows how an `AppRecord` or a built-in service maps onto a
//! listen block and an nginx site, and leaves the file handling to the
//! generator.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use djinn_state::{AppInstance, AppRecord};

use crate::error::ProxyResult;
use crate::generator::{ListenSpec, ProxyGenerator, RegenOutcome};
use crate::haproxy::APP_HEALTH_CHECK;
use crate::nginx::NginxSite;
use crate::policy::{BuiltinService, ConnectionPolicy};

const APP_PREFIX: &str = "gae_";

pub fn app_block_name(app_id: &str) -> String {
    format!("{APP_PREFIX}{app_id}")
}

pub struct ProxySync {
    generator: Arc<ProxyGenerator>,
    /// Private IP of this load balancer.
    bind_ip: String,
    ssl_certificate: PathBuf,
    ssl_certificate_key: PathBuf,
}

impl ProxySync {
    pub fn new(generator: Arc<ProxyGenerator>, bind_ip: &str) -> Self {
        Self {
            generator,
            bind_ip: bind_ip.to_string(),
            ssl_certificate: PathBuf::from("/etc/nginx/mycert.pem"),
            ssl_certificate_key: PathBuf::from("/etc/nginx/mykey.pem"),
        }
    }

    pub fn with_ssl(mut self, certificate: PathBuf, key: PathBuf) -> Self {
        self.ssl_certificate = certificate;
        self.ssl_certificate_key = key;
        self
    }

    pub fn generator(&self) -> &Arc<ProxyGenerator> {
        &self.generator
    }

    /// Route an application: its HAProxy block, then its nginx site.
    /// Returns what happened to the HAProxy configuration.
    pub async fn sync_app(&self, app: &AppRecord) -> ProxyResult<RegenOutcome> {
        let listen = ListenSpec {
            bind_ip: self.bind_ip.clone(),
            port: app.proxy_port,
            policy: ConnectionPolicy::for_app(app.threadsafe),
            http_check: Some(APP_HEALTH_CHECK.to_string()),
        };
        let outcome = self
            .generator
            .regenerate_config(&app_block_name(&app.app_id), &app.instances, &listen)
            .await?;

        if app.instances.is_empty() {
            self.generator.remove_site(&app.app_id).await?;
        } else {
            let site = NginxSite {
                app_id: app.app_id.clone(),
                upstream_host: self.bind_ip.clone(),
                upstream_port: app.proxy_port,
                http_port: app.http_port,
                https_port: app.https_port,
                ssl_certificate: self.ssl_certificate.clone(),
                ssl_certificate_key: self.ssl_certificate_key.clone(),
            };
            self.generator.write_site(&site).await?;
        }
        debug!(app = %app.app_id, instances = app.instances.len(), ?outcome, "app routing synced");
        Ok(outcome)
    }

    pub async fn remove_app(&self, app_id: &str) -> ProxyResult<RegenOutcome> {
        let outcome = self.generator.remove_service(&app_block_name(app_id)).await?;
        self.generator.remove_site(app_id).await?;
        info!(app = %app_id, "app routing removed");
        Ok(outcome)
    }

    /// Route a platform service to every host holding it.
    pub async fn sync_service(&self, service: BuiltinService, hosts: &[String]) -> ProxyResult<RegenOutcome> {
        let backends: Vec<AppInstance> = hosts
            .iter()
            .map(|h| AppInstance::new(h, service.backend_port()))
            .collect();
        let listen = ListenSpec {
            bind_ip: self.bind_ip.clone(),
            port: service.listen_port(),
            policy: service.policy(),
            http_check: None,
        };
        self.generator
            .regenerate_config(service.block_name(), &backends, &listen)
            .await
    }

    /// Apps with a listen block on disk that are not in `apps`.
    pub async fn stale_apps(&self, apps: &BTreeMap<String, AppRecord>) -> ProxyResult<Vec<String>> {
        Ok(self
            .generator
            .services()
            .await?
            .into_iter()
            .filter_map(|block| block.strip_prefix(APP_PREFIX).map(str::to_string))
            .filter(|app_id| !apps.contains_key(app_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use djinn_core::config::ProxyConfig;

    use crate::controller::{DryRunController, ProxyKind};

    fn setup() -> (tempfile::TempDir, Arc<DryRunController>, ProxySync) {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig {
            haproxy_dir: dir.path().join("haproxy"),
            nginx_dir: dir.path().join("nginx"),
            reload_cooldown_ms: 1,
            ..ProxyConfig::default()
        };
        let ctl = Arc::new(DryRunController::new());
        let generator = Arc::new(ProxyGenerator::new(&config, ctl.clone()));
        (dir, ctl, ProxySync::new(generator, "10.0.0.1"))
    }

    fn app(id: &str, proxy_port: u16, instances: &[(&str, u16)]) -> AppRecord {
        let mut app = AppRecord::new(id, "python27", false).with_ports(8080, 4380, proxy_port);
        for (host, port) in instances {
            app.add_instance(host, *port).unwrap();
        }
        app
    }

    #[tokio::test]
    async fn app_gets_block_and_site() {
        let (_dir, ctl, sync) = setup();
        let outcome = sync.sync_app(&app("guestbook", 10000, &[("10.0.0.2", 20000)])).await.unwrap();
        assert_eq!(outcome, RegenOutcome::Reloaded);

        let active = std::fs::read_to_string(sync.generator().haproxy_config_path()).unwrap();
        assert!(active.contains("server gae_guestbook-10.0.0.2:20000 10.0.0.2:20000 maxconn 1 check"));
        assert!(sync.generator().nginx_site_path("guestbook").exists());
        assert_eq!(ctl.reload_count(ProxyKind::Nginx), 1);
    }

    #[tokio::test]
    async fn stale_apps_are_blocks_without_a_record() {
        let (_dir, _ctl, sync) = setup();
        let mut apps = BTreeMap::new();
        apps.insert("a".to_string(), app("a", 10000, &[("10.0.0.2", 20000)]));
        apps.insert("b".to_string(), app("b", 10001, &[("10.0.0.2", 20001)]));
        for record in apps.values() {
            sync.sync_app(record).await.unwrap();
        }
        sync.sync_service(BuiltinService::Datastore, &["10.0.0.5".to_string()])
            .await
            .unwrap();
        assert!(sync.stale_apps(&apps).await.unwrap().is_empty());

        apps.remove("b");
        assert_eq!(sync.stale_apps(&apps).await.unwrap(), vec!["b"]);

        sync.remove_app("b").await.unwrap();
        assert!(sync.stale_apps(&apps).await.unwrap().is_empty());
        assert!(!sync.generator().nginx_site_path("b").exists());
    }

    #[tokio::test]
    async fn builtin_service_uses_its_cap() {
        let (_dir, _ctl, sync) = setup();
        sync.sync_service(BuiltinService::Datastore, &["10.0.0.5".to_string()])
            .await
            .unwrap();
        let active = std::fs::read_to_string(sync.generator().haproxy_config_path()).unwrap();
        assert!(active.contains("bind 10.0.0.1:8888"));
        assert!(active.contains("10.0.0.5:4000 maxconn 2 check"));
    }
}
