//! The role vocabulary.
//!
//! Roles serialize in kebab-case (`database-master`). The older underscore
//! job names (`db_master`, `appengine`, ...) are accepted on input so that
//! layouts written by existing tooling keep working.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[serde(alias = "zookeeper")]
    CoordinationService,
    #[serde(alias = "db_master")]
    DatabaseMaster,
    #[serde(alias = "db_slave")]
    DatabaseSlave,
    #[serde(alias = "taskqueue_master")]
    TaskQueueMaster,
    #[serde(alias = "taskqueue_slave")]
    TaskQueueSlave,
    Memcache,
    Search,
    #[serde(alias = "load_balancer")]
    LoadBalancer,
    #[serde(alias = "appengine")]
    ApplicationHost,
    Shadow,
    Open,
}

impl Role {
    pub const ALL: [Role; 11] = [
        Role::CoordinationService,
        Role::DatabaseMaster,
        Role::DatabaseSlave,
        Role::TaskQueueMaster,
        Role::TaskQueueSlave,
        Role::Memcache,
        Role::Search,
        Role::LoadBalancer,
        Role::ApplicationHost,
        Role::Shadow,
        Role::Open,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::CoordinationService => "coordination-service",
            Role::DatabaseMaster => "database-master",
            Role::DatabaseSlave => "database-slave",
            Role::TaskQueueMaster => "task-queue-master",
            Role::TaskQueueSlave => "task-queue-slave",
            Role::Memcache => "memcache",
            Role::Search => "search",
            Role::LoadBalancer => "load-balancer",
            Role::ApplicationHost => "application-host",
            Role::Shadow => "shadow",
            Role::Open => "open",
        }
    }

    /// Start precedence. Lower starts first; stop order is the reverse.
    ///
    /// Later tiers depend on earlier ones being reachable: the datastore
    /// registers itself in the coordination store, the load balancer
    /// routes to the datastore, application hosts sit behind the load
    /// balancer.
    pub fn precedence(&self) -> u8 {
        match self {
            Role::CoordinationService => 0,
            Role::DatabaseMaster | Role::DatabaseSlave => 1,
            Role::TaskQueueMaster | Role::TaskQueueSlave | Role::Memcache | Role::Search => 2,
            Role::LoadBalancer => 3,
            Role::ApplicationHost => 4,
            Role::Shadow => 5,
            Role::Open => 6,
        }
    }

    pub fn is_database(&self) -> bool {
        matches!(self, Role::DatabaseMaster | Role::DatabaseSlave)
    }

    pub fn is_task_queue(&self) -> bool {
        matches!(self, Role::TaskQueueMaster | Role::TaskQueueSlave)
    }

    /// Sort roles into start order, ties broken by declaration order.
    pub fn start_order(roles: &mut [Role]) {
        roles.sort_by_key(|r| (r.precedence(), *r));
    }

    /// Sort roles into stop order (the reverse of start order).
    pub fn stop_order(roles: &mut [Role]) {
        roles.sort_by_key(|r| std::cmp::Reverse((r.precedence(), *r)));
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.trim().to_string()))
            .map_err(|_| StateError::UnknownRole(s.to_string()))
    }
}
