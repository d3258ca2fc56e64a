//! Validating and reloading the proxy processes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::process::Command;
use tracing::{debug, info};

use djinn_core::BoxFuture;

use crate::error::{ProxyError, ProxyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProxyKind {
    Haproxy,
    Nginx,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyKind::Haproxy => f.write_str("haproxy"),
            ProxyKind::Nginx => f.write_str("nginx"),
        }
    }
}

/// The running proxy processes.
pub trait ProxyController: Send + Sync {
    /// Syntax-check `config` without applying it.
    fn validate<'a>(&'a self, kind: ProxyKind, config: &'a Path) -> BoxFuture<'a, ProxyResult<()>>;

    /// Gracefully reload from the active file at `config`.
    fn reload<'a>(&'a self, kind: ProxyKind, config: &'a Path) -> BoxFuture<'a, ProxyResult<()>>;
}

// ── Real processes ─────────────────────────────────────────────────

/// Runs the proxy binaries.
pub struct CommandController {
    haproxy_bin: PathBuf,
    nginx_bin: PathBuf,
    haproxy_pidfile: PathBuf,
}

impl CommandController {
    pub fn new(haproxy_bin: PathBuf, nginx_bin: PathBuf, haproxy_pidfile: PathBuf) -> Self {
        Self {
            haproxy_bin,
            nginx_bin,
            haproxy_pidfile,
        }
    }

    async fn run(kind: ProxyKind, cmd: &mut Command) -> ProxyResult<std::process::Output> {
        debug!(%kind, ?cmd, "running proxy command");
        cmd.output().await.map_err(|e| ProxyError::Reload {
            proxy: kind.to_string(),
            reason: e.to_string(),
        })
    }

    async fn old_haproxy_pids(&self) -> Vec<String> {
        match tokio::fs::read_to_string(&self.haproxy_pidfile).await {
            Ok(text) => text.split_whitespace().map(str::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl ProxyController for CommandController {
    fn validate<'a>(&'a self, kind: ProxyKind, config: &'a Path) -> BoxFuture<'a, ProxyResult<()>> {
        Box::pin(async move {
            let output = match kind {
                ProxyKind::Haproxy => {
                    Self::run(kind, Command::new(&self.haproxy_bin).arg("-c").arg("-f").arg(config)).await?
                }
                // nginx checks its whole tree, site files included.
                ProxyKind::Nginx => Self::run(kind, Command::new(&self.nginx_bin).arg("-t")).await?,
            };
            if output.status.success() {
                Ok(())
            } else {
                Err(ProxyError::Validation {
                    proxy: kind.to_string(),
                    output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        })
    }

    fn reload<'a>(&'a self, kind: ProxyKind, config: &'a Path) -> BoxFuture<'a, ProxyResult<()>> {
        Box::pin(async move {
            let output = match kind {
                ProxyKind::Haproxy => {
                    // New process takes the listeners; old ones finish in-flight requests.
                    let old = self.old_haproxy_pids().await;
                    let mut cmd = Command::new(&self.haproxy_bin);
                    cmd.arg("-f").arg(config).arg("-p").arg(&self.haproxy_pidfile).arg("-D");
                    if !old.is_empty() {
                        cmd.arg("-sf").args(&old);
                    }
                    Self::run(kind, &mut cmd).await?
                }
                ProxyKind::Nginx => {
                    let reload = Self::run(kind, Command::new(&self.nginx_bin).args(["-s", "reload"])).await?;
                    if reload.status.success() {
                        reload
                    } else {
                        // Not running yet.
                        Self::run(kind, &mut Command::new(&self.nginx_bin)).await?
                    }
                }
            };
            if !output.status.success() {
                return Err(ProxyError::Reload {
                    proxy: kind.to_string(),
                    reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            info!(%kind, config = %config.display(), "proxy reloaded");
            Ok(())
        })
    }
}

// ── Dry run ────────────────────────────────────────────────────────

#[derive(Default)]
struct DryRunState {
    reloads: Vec<(ProxyKind, PathBuf)>,
    reject: Option<String>,
    fail_reloads: bool,
}

/// Accepts every configuration and reload unless told otherwise, and
/// counts reloads.
#[derive(Default)]
pub struct DryRunController {
    state: Mutex<DryRunState>,
}

impl DryRunController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any configuration containing `marker` until cleared.
    pub fn reject_containing(&self, marker: Option<&str>) {
        self.lock().reject = marker.map(str::to_string);
    }

    pub fn reload_count(&self, kind: ProxyKind) -> usize {
        self.lock().reloads.iter().filter(|(k, _)| *k == kind).count()
    }

    /// Fail every reload until cleared.
    pub fn fail_reloads(&self, fail: bool) {
        self.lock().fail_reloads = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DryRunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ProxyController for DryRunController {
    fn validate<'a>(&'a self, kind: ProxyKind, config: &'a Path) -> BoxFuture<'a, ProxyResult<()>> {
        Box::pin(async move {
            let reject = self.lock().reject.clone();
            let Some(marker) = reject else {
                return Ok(());
            };
            let text = tokio::fs::read_to_string(config)
                .await
                .map_err(|e| ProxyError::io(config, e))?;
            if text.contains(&marker) {
                return Err(ProxyError::Validation {
                    proxy: kind.to_string(),
                    output: format!("rejected {marker:?}"),
                });
            }
            Ok(())
        })
    }

    fn reload<'a>(&'a self, kind: ProxyKind, config: &'a Path) -> BoxFuture<'a, ProxyResult<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.fail_reloads {
                return Err(ProxyError::Reload {
                    proxy: kind.to_string(),
                    reason: "dry-run reload failure".to_string(),
                });
            }
            debug!(%kind, config = %config.display(), "dry-run reload");
            state.reloads.push((kind, config.to_path_buf()));
            Ok(())
        })
    }
}
