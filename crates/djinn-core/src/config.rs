//! djinn.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::retry::RetryPolicy;

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/appscale/djinn.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DjinnConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Per-role command overrides, keyed by role name.
    #[serde(default)]
    pub services: HashMap<String, ServiceOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub private_ip: String,
    pub public_ip: String,
    /// Inline secret. Takes precedence over `secret_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default = "default_secret_path")]
    pub secret_path: PathBuf,
}

fn default_secret_path() -> PathBuf {
    PathBuf::from("/etc/appscale/secret.key")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_port")]
    pub port: u16,
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,
}

fn default_control_port() -> u16 {
    17443
}
fn default_peer_timeout() -> u64 {
    10_000
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            port: default_control_port(),
            peer_timeout_ms: default_peer_timeout(),
        }
    }
}

impl ControlConfig {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// `host:port` of coordination servers, tried in order.
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Port the embedded coordination server listens on.
    #[serde(default = "default_coord_port")]
    pub port: u16,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_connect_wait")]
    pub connect_wait_ms: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_lock_retry_interval")]
    pub lock_retry_interval_ms: u64,
    #[serde(default = "default_lock_max_wait")]
    pub lock_max_wait_ms: u64,
    /// Overall bound on a single client call. Unset means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_timeout_ms: Option<u64>,
    #[serde(default = "default_coord_data_dir")]
    pub data_dir: PathBuf,
}

fn default_coord_port() -> u16 {
    2181
}
fn default_session_timeout() -> u64 {
    10_000
}
fn default_connect_wait() -> u64 {
    30_000
}
fn default_retry_interval() -> u64 {
    1_000
}
fn default_write_retries() -> u32 {
    5
}
fn default_lock_retry_interval() -> u64 {
    1_000
}
fn default_lock_max_wait() -> u64 {
    300_000
}
fn default_coord_data_dir() -> PathBuf {
    PathBuf::from("/opt/appscale/coordination")
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            port: default_coord_port(),
            session_timeout_ms: default_session_timeout(),
            connect_wait_ms: default_connect_wait(),
            retry_interval_ms: default_retry_interval(),
            write_retries: default_write_retries(),
            lock_retry_interval_ms: default_lock_retry_interval(),
            lock_max_wait_ms: default_lock_max_wait(),
            op_timeout_ms: None,
            data_dir: default_coord_data_dir(),
        }
    }
}

impl CoordinationConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.connect_wait_ms)
    }

    pub fn op_timeout(&self) -> Option<Duration> {
        self.op_timeout_ms.map(Duration::from_millis)
    }

    /// Policy for connection-loss retries: fixed interval, never gives up.
    pub fn transient_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.retry_interval_ms))
    }

    /// Policy for retryable write failures: exponential backoff, bounded.
    pub fn write_policy(&self) -> RetryPolicy {
        RetryPolicy::backoff().with_max_attempts(self.write_retries)
    }

    /// Policy for lock acquisition: fixed interval, bounded by a time budget.
    pub fn lock_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.lock_retry_interval_ms))
            .with_max_elapsed(Duration::from_millis(self.lock_max_wait_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// How long a reader may observe state that lags the store. Passes
    /// are forced once this elapses even if the store looks unchanged.
    #[serde(default = "default_staleness_bound")]
    pub staleness_bound_secs: u64,
    #[serde(default = "default_crash_record_path")]
    pub crash_record_path: PathBuf,
}

fn default_reconcile_interval() -> u64 {
    10
}
fn default_max_failures() -> u32 {
    10
}
fn default_staleness_bound() -> u64 {
    60
}
fn default_crash_record_path() -> PathBuf {
    PathBuf::from("/var/log/appscale/djinn_crash.json")
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            max_consecutive_failures: default_max_failures(),
            staleness_bound_secs: default_staleness_bound(),
            crash_record_path: default_crash_record_path(),
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn staleness_bound(&self) -> Duration {
        Duration::from_secs(self.staleness_bound_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_haproxy_dir")]
    pub haproxy_dir: PathBuf,
    #[serde(default = "default_nginx_dir")]
    pub nginx_dir: PathBuf,
    #[serde(default = "default_haproxy_bin")]
    pub haproxy_bin: PathBuf,
    #[serde(default = "default_nginx_bin")]
    pub nginx_bin: PathBuf,
    /// Skip the external syntax check and reload.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_reload_cooldown")]
    pub reload_cooldown_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,
    #[serde(default = "default_server_timeout")]
    pub server_timeout_secs: u64,
    #[serde(default = "default_ssl_cert")]
    pub ssl_certificate: PathBuf,
    #[serde(default = "default_ssl_key")]
    pub ssl_certificate_key: PathBuf,
}

fn default_haproxy_dir() -> PathBuf {
    PathBuf::from("/etc/haproxy")
}
fn default_nginx_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-enabled")
}
fn default_haproxy_bin() -> PathBuf {
    PathBuf::from("/usr/sbin/haproxy")
}
fn default_nginx_bin() -> PathBuf {
    PathBuf::from("/usr/sbin/nginx")
}
fn default_reload_cooldown() -> u64 {
    100
}
fn default_connect_timeout() -> u64 {
    120
}
fn default_client_timeout() -> u64 {
    50
}
fn default_server_timeout() -> u64 {
    600
}
fn default_ssl_cert() -> PathBuf {
    PathBuf::from("/etc/nginx/mycert.pem")
}
fn default_ssl_key() -> PathBuf {
    PathBuf::from("/etc/nginx/mykey.pem")
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            haproxy_dir: default_haproxy_dir(),
            nginx_dir: default_nginx_dir(),
            haproxy_bin: default_haproxy_bin(),
            nginx_bin: default_nginx_bin(),
            dry_run: false,
            reload_cooldown_ms: default_reload_cooldown(),
            connect_timeout_secs: default_connect_timeout(),
            client_timeout_secs: default_client_timeout(),
            server_timeout_secs: default_server_timeout(),
            ssl_certificate: default_ssl_cert(),
            ssl_certificate_key: default_ssl_key(),
        }
    }
}

impl ProxyConfig {
    pub fn reload_cooldown(&self) -> Duration {
        Duration::from_millis(self.reload_cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupervisorKind {
    Monit,
    DryRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_supervisor_kind")]
    pub kind: SupervisorKind,
    #[serde(default = "default_monit_bin")]
    pub monit_bin: PathBuf,
    #[serde(default = "default_monit_dir")]
    pub config_dir: PathBuf,
    #[serde(default = "default_supervisor_retries")]
    pub retries: u32,
    #[serde(default = "default_supervisor_wait")]
    pub retry_wait_ms: u64,
    #[serde(default = "default_port_wait")]
    pub port_wait_secs: u64,
}

fn default_supervisor_kind() -> SupervisorKind {
    SupervisorKind::Monit
}
fn default_monit_bin() -> PathBuf {
    PathBuf::from("/usr/bin/monit")
}
fn default_monit_dir() -> PathBuf {
    PathBuf::from("/etc/monit/conf.d")
}
fn default_supervisor_retries() -> u32 {
    10
}
fn default_supervisor_wait() -> u64 {
    3_000
}
fn default_port_wait() -> u64 {
    60
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            kind: default_supervisor_kind(),
            monit_bin: default_monit_bin(),
            config_dir: default_monit_dir(),
            retries: default_supervisor_retries(),
            retry_wait_ms: default_supervisor_wait(),
            port_wait_secs: default_port_wait(),
        }
    }
}

impl SupervisorConfig {
    pub fn command_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(Duration::from_millis(self.retry_wait_ms))
            .with_max_attempts(self.retries)
    }

    pub fn port_wait(&self) -> Duration {
        Duration::from_secs(self.port_wait_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info,djinnd=debug,djinn=debug".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

/// Replaces the built-in command and port for one role's service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceOverride {
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl DjinnConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: DjinnConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject listen ports that collide: the control plane, the embedded
    /// coordination server when no endpoints are configured, and every
    /// per-role service override.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut claims = vec![("control.port".to_string(), self.control.port)];
        if self.coordination.endpoints.is_empty() {
            claims.push(("coordination.port".to_string(), self.coordination.port));
        }
        let mut overrides: Vec<_> = self
            .services
            .iter()
            .filter_map(|(role, o)| o.port.map(|port| (format!("services.{role}.port"), port)))
            .collect();
        overrides.sort();
        claims.extend(overrides);

        let mut seen: BTreeMap<u16, String> = BTreeMap::new();
        for (owner, port) in claims {
            if let Some(first) = seen.get(&port) {
                return Err(ConfigError::DuplicatePort {
                    port,
                    first: first.clone(),
                    second: owner,
                });
            }
            seen.insert(port, owner);
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Minimal configuration for a node, every section at its default.
    pub fn for_node(private_ip: &str, public_ip: &str) -> Self {
        DjinnConfig {
            node: NodeConfig {
                private_ip: private_ip.to_string(),
                public_ip: public_ip.to_string(),
                secret: None,
                secret_path: default_secret_path(),
            },
            control: ControlConfig::default(),
            coordination: CoordinationConfig::default(),
            reconcile: ReconcileConfig::default(),
            proxy: ProxyConfig::default(),
            supervisor: SupervisorConfig::default(),
            logging: LoggingConfig::default(),
            services: HashMap::new(),
        }
    }

    /// Coordination endpoints to dial. Falls back to this node's own
    /// embedded server when none are configured.
    pub fn coordination_endpoints(&self) -> Vec<String> {
        if self.coordination.endpoints.is_empty() {
            vec![format!("{}:{}", self.node.private_ip, self.coordination.port)]
        } else {
            self.coordination.endpoints.clone()
        }
    }
}
