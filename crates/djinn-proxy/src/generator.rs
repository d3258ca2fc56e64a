//! ProxyGenerator — fragments in, validated and reloaded configuration out.
//!
//! # HAProxy
//!
//! ```text
//! regenerate_config(name, backends, listen)
//!   │  render ListenBlock, merge with <haproxy_dir>/fragments/*.cfg
//!   ▼
//! apply
//!   │  assemble base + blocks (duplicate port ──► Invalid)
//!   │  byte-equal to haproxy.cfg? ──► Unchanged (no reload)
//!   │  write haproxy.cfg.candidate, validate
//!   │     invalid ──► delete candidate, keep haproxy.cfg ──► RolledBack
//!   ▼  rename over haproxy.cfg, reload (after cooldown)
//!         reload fails ──► put the previous haproxy.cfg back ──► RolledBack
//!      ──► Reloaded, and only now store the fragment
//! ```
//!
//! # Nginx
//!
//! Site files are included by nginx itself. A changed site is written in
//! place with the previous content kept aside, `nginx -t` runs, and a
//! site that is rejected or fails to reload is put back the way it was.
//!
//! Invalid configuration and failed reloads are logged and leave the
//! previous configuration in place; they are not errors for the caller.
//! Only I/O failures are.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use djinn_core::config::ProxyConfig;
use djinn_state::AppInstance;

use crate::controller::{ProxyController, ProxyKind};
use crate::error::{ProxyError, ProxyResult};
use crate::haproxy::{self, BaseTemplate, ListenBlock};
use crate::nginx::{NginxSite, site_file_name};
use crate::policy::ConnectionPolicy;

const FRAGMENT_DIR: &str = "fragments";
const HAPROXY_FILE: &str = "haproxy.cfg";
const CANDIDATE_SUFFIX: &str = "candidate";

/// What a regeneration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegenOutcome {
    /// Content matched the active file; nothing reloaded.
    Unchanged,
    Reloaded,
    /// Validation or reload failed; the previous configuration is still
    /// active.
    RolledBack(String),
    /// The assembled configuration is inconsistent and was not written.
    Invalid(String),
}

/// Where a listen block binds and how it treats its backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub bind_ip: String,
    pub port: u16,
    pub policy: ConnectionPolicy,
    pub http_check: Option<String>,
}

pub struct ProxyGenerator {
    haproxy_dir: PathBuf,
    nginx_dir: PathBuf,
    base: BaseTemplate,
    controller: Arc<dyn ProxyController>,
    cooldown: Duration,
    last_reload: Mutex<Option<Instant>>,
    // Serializes rebuilds.
    rebuild_lock: Mutex<()>,
    regenerations: AtomicU64,
}

impl ProxyGenerator {
    pub fn new(config: &ProxyConfig, controller: Arc<dyn ProxyController>) -> Self {
        Self {
            haproxy_dir: config.haproxy_dir.clone(),
            nginx_dir: config.nginx_dir.clone(),
            base: BaseTemplate {
                stats_socket: "/var/run/appscale/haproxy-stats".to_string(),
                connect_timeout: Duration::from_secs(config.connect_timeout_secs),
                client_timeout: Duration::from_secs(config.client_timeout_secs),
                server_timeout: Duration::from_secs(config.server_timeout_secs),
            },
            controller,
            cooldown: config.reload_cooldown(),
            last_reload: Mutex::new(None),
            rebuild_lock: Mutex::new(()),
            regenerations: AtomicU64::new(0),
        }
    }

    pub fn haproxy_config_path(&self) -> PathBuf {
        self.haproxy_dir.join(HAPROXY_FILE)
    }

    pub fn fragment_dir(&self) -> PathBuf {
        self.haproxy_dir.join(FRAGMENT_DIR)
    }

    pub fn nginx_site_path(&self, app_id: &str) -> PathBuf {
        self.nginx_dir.join(site_file_name(app_id))
    }

    /// Calls to [`Self::regenerate_config`] and [`Self::remove_service`].
    pub fn regeneration_count(&self) -> u64 {
        self.regenerations.load(Ordering::SeqCst)
    }

    // ── HAProxy ────────────────────────────────────────────────────

    /// Replace the block for `name` and rebuild.
    ///
    /// An empty backend list removes the block: a service being torn
    /// down has nothing to route to, which is not an error.
    pub async fn regenerate_config(
        &self,
        name: &str,
        backends: &[AppInstance],
        listen: &ListenSpec,
    ) -> ProxyResult<RegenOutcome> {
        check_name(name)?;
        self.regenerations.fetch_add(1, Ordering::SeqCst);

        let mut block = ListenBlock::new(name, &listen.bind_ip, listen.port, listen.policy)
            .with_servers(backends.iter().cloned());
        if let Some(check) = &listen.http_check {
            block = block.with_http_check(check);
        }

        let _guard = self.rebuild_lock.lock().await;
        let mut fragments = self.read_fragments().await?;
        let rendered = block.render();
        match &rendered {
            Some(text) => {
                fragments.insert(name.to_string(), text.clone());
            }
            None => {
                debug!(service = %name, "no backends, dropping block");
                fragments.remove(name);
            }
        }
        let outcome = self.apply_locked(&fragments).await?;
        if matches!(outcome, RegenOutcome::Reloaded | RegenOutcome::Unchanged) {
            match rendered {
                Some(text) => self.write_fragment(name, &text).await?,
                None => self.delete_fragment(name).await?,
            }
        }
        Ok(outcome)
    }

    /// Drop the block for `name` and rebuild.
    pub async fn remove_service(&self, name: &str) -> ProxyResult<RegenOutcome> {
        check_name(name)?;
        self.regenerations.fetch_add(1, Ordering::SeqCst);
        let _guard = self.rebuild_lock.lock().await;
        let mut fragments = self.read_fragments().await?;
        fragments.remove(name);
        let outcome = self.apply_locked(&fragments).await?;
        if matches!(outcome, RegenOutcome::Reloaded | RegenOutcome::Unchanged) {
            self.delete_fragment(name).await?;
        }
        Ok(outcome)
    }

    /// Names of the blocks currently on disk.
    pub async fn services(&self) -> ProxyResult<Vec<String>> {
        Ok(self.read_fragments().await?.into_keys().collect())
    }

    /// Reassemble the active file from the fragments on disk and make sure
    /// HAProxy serves it. HAProxy is signalled even when nothing changed,
    /// which starts it if it is not running.
    pub async fn start_haproxy(&self) -> ProxyResult<RegenOutcome> {
        let _guard = self.rebuild_lock.lock().await;
        let fragments = self.read_fragments().await?;
        let outcome = self.apply_locked(&fragments).await?;
        if outcome == RegenOutcome::Unchanged {
            self.reload(ProxyKind::Haproxy, &self.haproxy_config_path()).await?;
        }
        Ok(outcome)
    }

    /// Assemble, compare, validate, swap, reload. Fragments on disk are
    /// only updated by the caller once this reports success, so the
    /// directory always describes the active file.
    async fn apply_locked(&self, fragments: &BTreeMap<String, String>) -> ProxyResult<RegenOutcome> {
        let content = match haproxy::assemble(&self.base, fragments) {
            Ok(content) => content,
            Err(e @ ProxyError::DuplicatePort { .. }) => {
                error!(error = %e, "haproxy configuration not applied");
                return Ok(RegenOutcome::Invalid(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let active = self.haproxy_config_path();
        let previous = read_optional(&active).await?;
        if previous.as_deref() == Some(content.as_str()) {
            debug!("haproxy configuration unchanged");
            return Ok(RegenOutcome::Unchanged);
        }

        let candidate = active.with_extension(format!("cfg.{CANDIDATE_SUFFIX}"));
        write_file(&candidate, &content).await?;
        if let Err(e) = self.controller.validate(ProxyKind::Haproxy, &candidate).await {
            error!(error = %e, "haproxy rejected new configuration, keeping the old one");
            remove_optional(&candidate).await?;
            return Ok(RegenOutcome::RolledBack(e.to_string()));
        }
        tokio::fs::rename(&candidate, &active)
            .await
            .map_err(|e| ProxyError::io(&active, e))?;

        if let Err(e) = self.reload(ProxyKind::Haproxy, &active).await {
            error!(error = %e, "haproxy did not reload, restoring the previous configuration");
            restore(&active, previous).await?;
            return Ok(RegenOutcome::RolledBack(e.to_string()));
        }
        info!(blocks = fragments.len(), "haproxy configuration updated");
        Ok(RegenOutcome::Reloaded)
    }

    async fn read_fragments(&self) -> ProxyResult<BTreeMap<String, String>> {
        let dir = self.fragment_dir();
        let mut fragments = BTreeMap::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(fragments),
            Err(e) => return Err(ProxyError::io(&dir, e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| ProxyError::io(&dir, e))? {
            let path = entry.path();
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".cfg"))
            else {
                continue;
            };
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| ProxyError::io(&path, e))?;
            fragments.insert(name.to_string(), text);
        }
        Ok(fragments)
    }

    async fn write_fragment(&self, name: &str, text: &str) -> ProxyResult<()> {
        let path = self.fragment_dir().join(format!("{name}.cfg"));
        if read_optional(&path).await?.as_deref() == Some(text) {
            return Ok(());
        }
        write_file(&path, text).await
    }

    async fn delete_fragment(&self, name: &str) -> ProxyResult<()> {
        remove_optional(&self.fragment_dir().join(format!("{name}.cfg"))).await
    }

    // ── Nginx ──────────────────────────────────────────────────────

    /// Write one application's site file and reload nginx if it changed.
    pub async fn write_site(&self, site: &NginxSite) -> ProxyResult<RegenOutcome> {
        check_name(&site.app_id)?;
        let _guard = self.rebuild_lock.lock().await;
        let path = self.nginx_site_path(&site.app_id);
        let content = site.render();
        let previous = read_optional(&path).await?;
        if previous.as_deref() == Some(content.as_str()) {
            return Ok(RegenOutcome::Unchanged);
        }

        write_file(&path, &content).await?;
        if let Err(e) = self.controller.validate(ProxyKind::Nginx, &path).await {
            error!(app = %site.app_id, error = %e, "nginx rejected site, restoring previous file");
            restore(&path, previous).await?;
            return Ok(RegenOutcome::RolledBack(e.to_string()));
        }
        if let Err(e) = self.reload(ProxyKind::Nginx, &path).await {
            error!(app = %site.app_id, error = %e, "nginx did not reload, restoring previous file");
            restore(&path, previous).await?;
            return Ok(RegenOutcome::RolledBack(e.to_string()));
        }
        info!(app = %site.app_id, "nginx site updated");
        Ok(RegenOutcome::Reloaded)
    }

    pub async fn remove_site(&self, app_id: &str) -> ProxyResult<RegenOutcome> {
        check_name(app_id)?;
        let _guard = self.rebuild_lock.lock().await;
        let path = self.nginx_site_path(app_id);
        let Some(previous) = read_optional(&path).await? else {
            return Ok(RegenOutcome::Unchanged);
        };
        remove_optional(&path).await?;
        if let Err(e) = self.reload(ProxyKind::Nginx, &path).await {
            error!(app = %app_id, error = %e, "nginx did not reload, keeping the site");
            write_file(&path, &previous).await?;
            return Ok(RegenOutcome::RolledBack(e.to_string()));
        }
        Ok(RegenOutcome::Reloaded)
    }

    /// Reload, waiting out the cooldown since the previous reload.
    async fn reload(&self, kind: ProxyKind, path: &Path) -> ProxyResult<()> {
        let mut last = self.last_reload.lock().await;
        if let Some(at) = *last {
            let since = at.elapsed();
            if since < self.cooldown {
                tokio::time::sleep(self.cooldown - since).await;
            }
        }
        let result = self.controller.reload(kind, path).await;
        *last = Some(Instant::now());
        if let Err(e) = &result {
            warn!(%kind, error = %e, "reload failed");
        }
        result
    }
}

fn check_name(name: &str) -> ProxyResult<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(ProxyError::InvalidName(name.to_string()))
    }
}

async fn read_optional(path: &Path) -> ProxyResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ProxyError::io(path, e)),
    }
}

async fn write_file(path: &Path, content: &str) -> ProxyResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ProxyError::io(parent, e))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(|e| ProxyError::io(path, e))
}

/// Put `path` back to `previous`, removing it if there was nothing before.
async fn restore(path: &Path, previous: Option<String>) -> ProxyResult<()> {
    match previous {
        Some(old) => write_file(path, &old).await,
        None => remove_optional(path).await,
    }
}

async fn remove_optional(path: &Path) -> ProxyResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProxyError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::DryRunController;

    fn setup() -> (tempfile::TempDir, Arc<DryRunController>, ProxyGenerator) {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig {
            haproxy_dir: dir.path().join("haproxy"),
            nginx_dir: dir.path().join("nginx"),
            reload_cooldown_ms: 1,
            ..ProxyConfig::default()
        };
        let controller = Arc::new(DryRunController::new());
        let generator = ProxyGenerator::new(&config, controller.clone());
        (dir, controller, generator)
    }

    fn listen(port: u16) -> ListenSpec {
        ListenSpec {
            bind_ip: "10.0.0.1".into(),
            port,
            policy: ConnectionPolicy::Pooled(7),
            http_check: None,
        }
    }

    fn backends() -> Vec<AppInstance> {
        vec![AppInstance::new("10.0.0.2", 20000), AppInstance::new("10.0.0.3", 20000)]
    }

    #[tokio::test]
    async fn start_haproxy_signals_even_when_unchanged() {
        let (_dir, ctl, generator) = setup();
        assert_eq!(generator.start_haproxy().await.unwrap(), RegenOutcome::Reloaded);
        assert_eq!(generator.start_haproxy().await.unwrap(), RegenOutcome::Unchanged);
        assert_eq!(ctl.reload_count(ProxyKind::Haproxy), 2);
    }

    #[tokio::test]
    async fn identical_regeneration_does_not_reload() {
        let (_dir, ctl, generator) = setup();
        let first = generator.regenerate_config("gae_guestbook", &backends(), &listen(10000)).await.unwrap();
        assert_eq!(first, RegenOutcome::Reloaded);
        let before = std::fs::read(generator.haproxy_config_path()).unwrap();

        let second = generator.regenerate_config("gae_guestbook", &backends(), &listen(10000)).await.unwrap();
        assert_eq!(second, RegenOutcome::Unchanged);
        assert_eq!(std::fs::read(generator.haproxy_config_path()).unwrap(), before);
        assert_eq!(ctl.reload_count(ProxyKind::Haproxy), 1);
        assert_eq!(generator.regeneration_count(), 2);
    }

    #[tokio::test]
    async fn invalid_config_rolls_back() {
        let (_dir, ctl, generator) = setup();
        generator.regenerate_config("gae_guestbook", &backends(), &listen(10000)).await.unwrap();
        let good = std::fs::read_to_string(generator.haproxy_config_path()).unwrap();

        ctl.reject_containing(Some("gae_broken"));
        let outcome = generator.regenerate_config("gae_broken", &backends(), &listen(10001)).await.unwrap();
        assert!(matches!(outcome, RegenOutcome::RolledBack(_)));
        assert_eq!(std::fs::read_to_string(generator.haproxy_config_path()).unwrap(), good);
        assert_eq!(ctl.reload_count(ProxyKind::Haproxy), 1);
        assert!(!generator.haproxy_config_path().with_extension("cfg.candidate").exists());
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_config() {
        let (_dir, ctl, generator) = setup();
        generator.regenerate_config("gae_guestbook", &backends(), &listen(10000)).await.unwrap();
        let good = std::fs::read_to_string(generator.haproxy_config_path()).unwrap();

        ctl.fail_reloads(true);
        let outcome = generator.regenerate_config("gae_other", &backends(), &listen(10001)).await.unwrap();
        assert!(matches!(outcome, RegenOutcome::RolledBack(_)), "{outcome:?}");
        assert_eq!(std::fs::read_to_string(generator.haproxy_config_path()).unwrap(), good);
        assert_eq!(generator.services().await.unwrap(), vec!["gae_guestbook"]);

        ctl.fail_reloads(false);
        let retried = generator.regenerate_config("gae_other", &backends(), &listen(10001)).await.unwrap();
        assert_eq!(retried, RegenOutcome::Reloaded);
        assert_eq!(ctl.reload_count(ProxyKind::Haproxy), 2);
    }

    #[tokio::test]
    async fn first_config_that_fails_to_reload_is_removed() {
        let (_dir, ctl, generator) = setup();
        ctl.fail_reloads(true);
        let outcome = generator.regenerate_config("gae_guestbook", &backends(), &listen(10000)).await.unwrap();
        assert!(matches!(outcome, RegenOutcome::RolledBack(_)));
        assert!(!generator.haproxy_config_path().exists());
        assert!(generator.services().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nginx_site_survives_failed_reload() {
        let (_dir, ctl, generator) = setup();
        let mut site = NginxSite {
            app_id: "guestbook".into(),
            upstream_host: "10.0.0.1".into(),
            upstream_port: 10000,
            http_port: 8080,
            https_port: 4380,
            ssl_certificate: "/etc/nginx/mycert.pem".into(),
            ssl_certificate_key: "/etc/nginx/mykey.pem".into(),
        };
        generator.write_site(&site).await.unwrap();
        let good = std::fs::read_to_string(generator.nginx_site_path("guestbook")).unwrap();

        ctl.fail_reloads(true);
        site.http_port = 8081;
        assert!(matches!(generator.write_site(&site).await.unwrap(), RegenOutcome::RolledBack(_)));
        assert_eq!(std::fs::read_to_string(generator.nginx_site_path("guestbook")).unwrap(), good);

        assert!(matches!(generator.remove_site("guestbook").await.unwrap(), RegenOutcome::RolledBack(_)));
        assert_eq!(std::fs::read_to_string(generator.nginx_site_path("guestbook")).unwrap(), good);
    }

    #[tokio::test]
    async fn duplicate_port_is_not_applied() {
        let (_dir, ctl, generator) = setup();
        generator.regenerate_config("gae_a", &backends(), &listen(10000)).await.unwrap();
        let outcome = generator.regenerate_config("gae_b", &backends(), &listen(10000)).await.unwrap();
        assert!(matches!(outcome, RegenOutcome::Invalid(_)));
        assert_eq!(ctl.reload_count(ProxyKind::Haproxy), 1);
        let active = std::fs::read_to_string(generator.haproxy_config_path()).unwrap();
        assert!(!active.contains("listen gae_b"));
    }

    #[tokio::test]
    async fn empty_backends_tear_down_block() {
        let (_dir, _ctl, generator) = setup();
        generator.regenerate_config("gae_guestbook", &backends(), &listen(10000)).await.unwrap();
        let outcome = generator.regenerate_config("gae_guestbook", &[], &listen(10000)).await.unwrap();
        assert_eq!(outcome, RegenOutcome::Reloaded);
        assert!(generator.services().await.unwrap().is_empty());
        let active = std::fs::read_to_string(generator.haproxy_config_path()).unwrap();
        assert!(!active.contains("gae_guestbook"));

        // Removing something that is not there changes nothing.
        assert_eq!(generator.remove_service("gae_guestbook").await.unwrap(), RegenOutcome::Unchanged);
    }

    #[tokio::test]
    async fn nginx_site_rollback_restores_previous() {
        let (_dir, ctl, generator) = setup();
        let mut site = NginxSite {
            app_id: "guestbook".into(),
            upstream_host: "10.0.0.1".into(),
            upstream_port: 10000,
            http_port: 8080,
            https_port: 4380,
            ssl_certificate: "/etc/nginx/mycert.pem".into(),
            ssl_certificate_key: "/etc/nginx/mykey.pem".into(),
        };
        assert_eq!(generator.write_site(&site).await.unwrap(), RegenOutcome::Reloaded);
        assert_eq!(generator.write_site(&site).await.unwrap(), RegenOutcome::Unchanged);
        let good = std::fs::read_to_string(generator.nginx_site_path("guestbook")).unwrap();

        ctl.reject_containing(Some("listen 9999;"));
        site.http_port = 9999;
        let outcome = generator.write_site(&site).await.unwrap();
        assert!(matches!(outcome, RegenOutcome::RolledBack(_)));
        assert_eq!(std::fs::read_to_string(generator.nginx_site_path("guestbook")).unwrap(), good);
        assert_eq!(ctl.reload_count(ProxyKind::Nginx), 1);

        assert_eq!(generator.remove_site("guestbook").await.unwrap(), RegenOutcome::Reloaded);
        assert!(!generator.nginx_site_path("guestbook").exists());
    }

    #[tokio::test]
    async fn reloads_respect_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig {
            haproxy_dir: dir.path().join("haproxy"),
            nginx_dir: dir.path().join("nginx"),
            reload_cooldown_ms: 100,
            ..ProxyConfig::default()
        };
        let generator = ProxyGenerator::new(&config, Arc::new(DryRunController::new()));
        let started = Instant::now();
        generator.regenerate_config("gae_a", &backends(), &listen(10000)).await.unwrap();
        generator.regenerate_config("gae_b", &backends(), &listen(10001)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn names_checked() {
        assert!(check_name("gae_guestbook").is_ok());
        assert!(check_name("../etc/passwd").is_err());
        assert!(check_name("").is_err());
    }
}
