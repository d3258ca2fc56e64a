//! monit-backed supervisor.
//!
//! Each service gets `appscale-<name>.cfg` in monit's `conf.d`, started
//! through `start-stop-daemon` with a pid file and watched as a group of
//! the same name. monit commands fail transiently while it services other
//! requests, so every invocation is retried per the command policy.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use djinn_core::{BoxFuture, RetryPolicy};
use djinn_core::config::SupervisorConfig;

use crate::error::{SupervisorError, SupervisorResult};
use crate::service::{ServiceSpec, ServiceSupervisor, is_safe_name};

const PID_DIR: &str = "/var/run/appscale";
const LOG_DIR: &str = "/var/log/appscale";
const START_STOP_DAEMON: &str = "/sbin/start-stop-daemon";

pub struct MonitSupervisor {
    config: SupervisorConfig,
    policy: RetryPolicy,
}

impl MonitSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let policy = config.command_policy();
        Self { config, policy }
    }

    /// Override the retry policy for monit invocations.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config_path(&self, name: &str) -> PathBuf {
        self.config.config_dir.join(format!("appscale-{name}.cfg"))
    }

    /// Render the monit stanza for a service.
    pub fn render(spec: &ServiceSpec) -> String {
        let pidfile = format!("{PID_DIR}/{}.pid", spec.name);
        let logfile = format!("{LOG_DIR}/{}.log", spec.name);
        let env: String = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v} "))
            .collect();
        let command = spec.command.join(" ");

        let mut out = String::new();
        out.push_str(&format!("check process {} with pidfile {pidfile}\n", spec.name));
        out.push_str(&format!("  group {}\n", spec.name));
        out.push_str(&format!(
            "  start program = \"{START_STOP_DAEMON} --start --background --make-pidfile \
             --pidfile {pidfile} --startas /bin/bash -- -c 'exec env {env}{command} >> {logfile} 2>&1'\"\n"
        ));
        out.push_str(&format!(
            "  stop program = \"{START_STOP_DAEMON} --stop --pidfile {pidfile} --retry=TERM/20/KILL/5\"\n"
        ));
        if let Some(mb) = spec.max_memory_mb {
            out.push_str(&format!("  if totalmem > {mb} MB for 10 cycles then restart\n"));
        }
        for port in &spec.ports {
            out.push_str(&format!(
                "  if failed host 127.0.0.1 port {port} for 3 cycles then restart\n"
            ));
        }
        out
    }

    /// Run `monit <args>` until it exits zero or the policy gives up.
    async fn run(&self, args: &[&str]) -> SupervisorResult<()> {
        let command = format!("{} {}", self.config.monit_bin.display(), args.join(" "));
        let mut retry = self.policy.start();
        loop {
            let status = Command::new(&self.config.monit_bin)
                .args(args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(SupervisorError::Spawn)?;
            if status.success() {
                debug!(%command, attempts = retry.attempts() + 1, "monit command succeeded");
                return Ok(());
            }
            let Some(pause) = retry.next_delay() else {
                return Err(SupervisorError::CommandFailed {
                    command,
                    attempts: retry.attempts(),
                });
            };
            warn!(%command, code = ?status.code(), attempts = retry.attempts(), "monit command failed, retrying");
            tokio::time::sleep(pause).await;
        }
    }

    async fn status_output(&self, name: &str) -> SupervisorResult<Option<String>> {
        let output = Command::new(&self.config.monit_bin)
            .args(["status", name])
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(SupervisorError::Spawn)?;
        if !output.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}

/// Read the `status` line of `monit status <name>` output.
fn reports_running(output: &str) -> bool {
    output.lines().any(|line| {
        let mut words = line.split_whitespace();
        words.next() == Some("status")
            && matches!(words.next(), Some("OK") | Some("Running"))
    })
}

impl ServiceSupervisor for MonitSupervisor {
    fn start<'a>(&'a self, spec: &'a ServiceSpec) -> BoxFuture<'a, SupervisorResult<()>> {
        Box::pin(async move {
            spec.validate()?;
            if self.is_running(&spec.name).await? {
                debug!(service = %spec.name, "already running");
                return Ok(());
            }

            let path = self.config_path(&spec.name);
            tokio::fs::create_dir_all(&self.config.config_dir)
                .await
                .map_err(|source| SupervisorError::ConfigWrite {
                    path: self.config.config_dir.clone(),
                    source,
                })?;
            tokio::fs::write(&path, Self::render(spec))
                .await
                .map_err(|source| SupervisorError::ConfigWrite {
                    path: path.clone(),
                    source,
                })?;

            self.run(&["reload"]).await?;
            if let Err(e) = self.run(&["monitor", "-g", &spec.name]).await {
                warn!(service = %spec.name, error = %e, "monitor failed, starting anyway");
            }
            self.run(&["start", "-g", &spec.name]).await?;
            info!(service = %spec.name, ports = ?spec.ports, "service started");
            Ok(())
        })
    }

    fn stop<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SupervisorResult<()>> {
        Box::pin(async move {
            if !is_safe_name(name) {
                return Err(SupervisorError::InvalidName(name.to_string()));
            }
            let path = self.config_path(name);
            if !path.exists() && !self.is_running(name).await? {
                debug!(service = %name, "already stopped");
                return Ok(());
            }

            self.run(&["stop", "-g", name]).await?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(SupervisorError::ConfigWrite { path, source }),
            }
            self.run(&["reload"]).await?;
            info!(service = %name, "service stopped");
            Ok(())
        })
    }

    fn is_running<'a>(&'a self, name: &'a str) -> BoxFuture<'a, SupervisorResult<bool>> {
        Box::pin(async move {
            if !is_safe_name(name) {
                return Err(SupervisorError::InvalidName(name.to_string()));
            }
            Ok(self
                .status_output(name)
                .await?
                .is_some_and(|out| reports_running(&out)))
        })
    }
}
