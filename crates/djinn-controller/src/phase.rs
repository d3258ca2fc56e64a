//! Controller lifecycle phases and the crash record.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{ControllerError, ControllerResult};

/// `Initializing → LoadingRoles → DoneLoading ⇄ Reconciling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// No deployment parameters yet.
    Initializing,
    /// Parameters known; this node's roles are being brought up.
    LoadingRoles,
    DoneLoading,
    /// A pass is applying a role delta.
    Reconciling,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initializing => "initializing",
            Phase::LoadingRoles => "loading-roles",
            Phase::DoneLoading => "done-loading",
            Phase::Reconciling => "reconciling",
        }
    }

    /// Phase a pass that is about to change roles moves to.
    pub fn entering_pass(self) -> Phase {
        match self {
            Phase::DoneLoading | Phase::Reconciling => Phase::Reconciling,
            Phase::Initializing | Phase::LoadingRoles => Phase::LoadingRoles,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic left behind for external tooling when the controller
/// gives up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub time: u64,
    pub node: String,
    pub reason: String,
    pub phase: Phase,
}

impl CrashRecord {
    pub fn new(node: &str, reason: &str, phase: Phase) -> Self {
        Self {
            time: djinn_core::epoch_secs(),
            node: node.to_string(),
            reason: reason.to_string(),
            phase,
        }
    }

    pub fn write(&self, path: &Path) -> ControllerResult<()> {
        let io = |source| ControllerError::CrashRecord {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io)?;
        }
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| io(std::io::Error::other(e)))?;
        std::fs::write(path, text).map_err(io)?;
        error!(path = %path.display(), reason = %self.reason, phase = %self.phase, "crash record written");
        Ok(())
    }

    pub fn read(path: &Path) -> ControllerResult<Self> {
        let io = |source| ControllerError::CrashRecord {
            path: path.to_path_buf(),
            source,
        };
        let text = std::fs::read_to_string(path).map_err(io)?;
        serde_json::from_str(&text).map_err(|e| io(std::io::Error::other(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_phase_transitions() {
        assert_eq!(Phase::DoneLoading.entering_pass(), Phase::Reconciling);
        assert_eq!(Phase::LoadingRoles.entering_pass(), Phase::LoadingRoles);
    }

    #[test]
    fn crash_record_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log/djinn_crash.json");
        let record = CrashRecord::new("10.0.0.1", "memcache would not start", Phase::Reconciling);
        record.write(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["node"], "10.0.0.1");
        assert_eq!(raw["phase"], "reconciling");
        assert!(raw["time"].as_u64().unwrap() > 0);
        assert_eq!(CrashRecord::read(&path).unwrap(), record);
    }
}
