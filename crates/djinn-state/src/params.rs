//! Deployment parameters.
//!
//! Parameters arrive once, as a flat key/value object, through
//! `set_parameters`. After validation they are immutable except for the
//! keys in [`MUTABLE_KEYS`], which `set_property` may change one at a time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{StateError, StateResult};

/// Keys `set_property` is allowed to change after initialization.
pub const MUTABLE_KEYS: &[&str] = &[
    "autoscale",
    "min_machines",
    "max_machines",
    "scaling_cooldown_secs",
    "min_app_instances",
    "max_app_instances",
    "verbose",
    "max_memory",
];

/// Keys that exist but are fixed once the deployment is initialized.
pub const IMMUTABLE_KEYS: &[&str] = &["keyname", "table", "replication", "multi_master", "login"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentParams {
    pub keyname: String,
    /// Datastore backend name.
    pub table: String,
    pub replication: u32,
    pub verbose: bool,
    pub autoscale: bool,
    pub min_machines: u32,
    pub max_machines: u32,
    pub scaling_cooldown_secs: u64,
    pub min_app_instances: u32,
    pub max_app_instances: u32,
    pub multi_master: bool,
    /// Per-instance memory cap in MB.
    pub max_memory: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    /// Unrecognized options, kept verbatim.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PropertyError {
    #[error("unknown property {0}")]
    Unknown(String),
    #[error("property {0} cannot be changed after initialization")]
    Immutable(String),
    #[error("bad value for {key}: {reason}")]
    BadValue { key: String, reason: String },
}

impl DeploymentParams {
    /// Decode and validate an options object.
    pub fn from_options(options: &serde_json::Map<String, Value>) -> StateResult<Self> {
        let mut params = Self {
            keyname: required_str(options, "keyname")?,
            table: required_str(options, "table")?,
            replication: 1,
            verbose: false,
            autoscale: true,
            min_machines: 1,
            max_machines: 1,
            scaling_cooldown_secs: 60,
            min_app_instances: 1,
            max_app_instances: 50,
            multi_master: false,
            max_memory: 400,
            login: None,
            extra: BTreeMap::new(),
        };

        for (key, value) in options {
            if key == "keyname" || key == "table" {
                continue;
            }
            let text = value_text(value).ok_or_else(|| StateError::InvalidParameter {
                key: key.clone(),
                reason: "expected a scalar value".to_string(),
            })?;
            match params.apply(key, &text) {
                Ok(()) => {}
                Err(PropertyError::Unknown(_)) => {
                    params.extra.insert(key.clone(), text);
                }
                Err(e) => {
                    return Err(StateError::InvalidParameter {
                        key: key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> StateResult<()> {
        if self.replication == 0 {
            return Err(StateError::InvalidParameter {
                key: "replication".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.min_machines > self.max_machines {
            return Err(StateError::InvalidParameter {
                key: "min_machines".to_string(),
                reason: format!("{} exceeds max_machines {}", self.min_machines, self.max_machines),
            });
        }
        if self.min_app_instances > self.max_app_instances {
            return Err(StateError::InvalidParameter {
                key: "min_app_instances".to_string(),
                reason: format!(
                    "{} exceeds max_app_instances {}",
                    self.min_app_instances, self.max_app_instances
                ),
            });
        }
        Ok(())
    }

    /// Set any known key, mutable or not.
    fn apply(&mut self, key: &str, value: &str) -> Result<(), PropertyError> {
        match key {
            "replication" => self.replication = parse(key, value)?,
            "verbose" => self.verbose = parse_bool(key, value)?,
            "autoscale" => self.autoscale = parse_bool(key, value)?,
            "min_machines" => self.min_machines = parse(key, value)?,
            "max_machines" => self.max_machines = parse(key, value)?,
            "scaling_cooldown_secs" => self.scaling_cooldown_secs = parse(key, value)?,
            "min_app_instances" => self.min_app_instances = parse(key, value)?,
            "max_app_instances" => self.max_app_instances = parse(key, value)?,
            "multi_master" => self.multi_master = parse_bool(key, value)?,
            "max_memory" => self.max_memory = parse(key, value)?,
            "login" => self.login = Some(value.to_string()),
            _ => return Err(PropertyError::Unknown(key.to_string())),
        }
        Ok(())
    }

    /// Change one allow-listed key. The whole object is revalidated and
    /// left untouched if the new value breaks an invariant.
    pub fn set_property(&mut self, key: &str, value: &str) -> Result<(), PropertyError> {
        if IMMUTABLE_KEYS.contains(&key) {
            return Err(PropertyError::Immutable(key.to_string()));
        }
        if !MUTABLE_KEYS.contains(&key) {
            return Err(PropertyError::Unknown(key.to_string()));
        }
        let mut candidate = self.clone();
        candidate.apply(key, value)?;
        candidate.validate().map_err(|e| PropertyError::BadValue {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        *self = candidate;
        Ok(())
    }

    /// Every parameter rendered as text, keyed by name.
    pub fn properties(&self) -> BTreeMap<String, String> {
        let mut props = self.extra.clone();
        props.insert("keyname".into(), self.keyname.clone());
        props.insert("table".into(), self.table.clone());
        props.insert("replication".into(), self.replication.to_string());
        props.insert("verbose".into(), self.verbose.to_string());
        props.insert("autoscale".into(), self.autoscale.to_string());
        props.insert("min_machines".into(), self.min_machines.to_string());
        props.insert("max_machines".into(), self.max_machines.to_string());
        props.insert(
            "scaling_cooldown_secs".into(),
            self.scaling_cooldown_secs.to_string(),
        );
        props.insert("min_app_instances".into(), self.min_app_instances.to_string());
        props.insert("max_app_instances".into(), self.max_app_instances.to_string());
        props.insert("multi_master".into(), self.multi_master.to_string());
        props.insert("max_memory".into(), self.max_memory.to_string());
        if let Some(login) = &self.login {
            props.insert("login".into(), login.clone());
        }
        props
    }
}

fn required_str(options: &serde_json::Map<String, Value>, key: &str) -> StateResult<String> {
    match options.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) | None => Err(StateError::MissingParameter(key.to_string())),
        Some(_) => Err(StateError::Malformed(format!("{key} must be a string"))),
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, PropertyError> {
    value.trim().parse().map_err(|_| PropertyError::BadValue {
        key: key.to_string(),
        reason: format!("cannot parse {value:?}"),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, PropertyError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(PropertyError::BadValue {
            key: key.to_string(),
            reason: format!("expected a boolean, got {value:?}"),
        }),
    }
}
