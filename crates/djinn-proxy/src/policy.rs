//! Per-backend connection caps.

use std::fmt;

/// How many concurrent requests one backend may receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPolicy {
    /// One request at a time, for backends that are not thread safe.
    Serialized,
    Pooled(u32),
}

impl ConnectionPolicy {
    /// Pool size for thread-safe application servers.
    pub const APP_POOL: u32 = 7;

    pub fn for_app(threadsafe: bool) -> Self {
        if threadsafe {
            ConnectionPolicy::Pooled(Self::APP_POOL)
        } else {
            ConnectionPolicy::Serialized
        }
    }

    pub fn max_connections(&self) -> u32 {
        match self {
            ConnectionPolicy::Serialized => 1,
            ConnectionPolicy::Pooled(n) => (*n).max(1),
        }
    }
}

/// Platform services load-balanced through HAProxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BuiltinService {
    Datastore,
    Search,
    UserAppServer,
    TaskQueue,
    Blobstore,
}

impl BuiltinService {
    pub const ALL: [BuiltinService; 5] = [
        BuiltinService::Datastore,
        BuiltinService::Search,
        BuiltinService::UserAppServer,
        BuiltinService::TaskQueue,
        BuiltinService::Blobstore,
    ];

    pub fn block_name(&self) -> &'static str {
        match self {
            BuiltinService::Datastore => "appscale-datastore_server",
            BuiltinService::Search => "appscale-search_server",
            BuiltinService::UserAppServer => "appscale-uaserver",
            BuiltinService::TaskQueue => "appscale-taskqueue",
            BuiltinService::Blobstore => "as_blob_server",
        }
    }

    /// Port HAProxy listens on for this service.
    pub fn listen_port(&self) -> u16 {
        match self {
            BuiltinService::Datastore => 8888,
            BuiltinService::Search => 53423,
            BuiltinService::UserAppServer => 4343,
            BuiltinService::TaskQueue => 17446,
            BuiltinService::Blobstore => 6106,
        }
    }

    /// Port the service itself listens on, on each node holding its role.
    pub fn backend_port(&self) -> u16 {
        match self {
            BuiltinService::Datastore => 4000,
            BuiltinService::Search => 53424,
            BuiltinService::UserAppServer => 4342,
            BuiltinService::TaskQueue => 17447,
            BuiltinService::Blobstore => 6107,
        }
    }

    pub fn policy(&self) -> ConnectionPolicy {
        match self {
            BuiltinService::Datastore | BuiltinService::Search => ConnectionPolicy::Pooled(2),
            BuiltinService::UserAppServer | BuiltinService::TaskQueue | BuiltinService::Blobstore => {
                ConnectionPolicy::Serialized
            }
        }
    }
}

impl fmt::Display for BuiltinService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.block_name())
    }
}
