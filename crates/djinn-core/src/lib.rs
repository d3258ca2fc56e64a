//! djinn-core — shared building blocks for the Djinn cluster controller.
//!
//! Holds the daemon configuration (`djinn.toml`), the retry policy object
//! used by every layer that waits on something, and the shared deployment
//! secret every remote call is checked against.

pub mod config;
pub mod error;
pub mod retry;
pub mod secret;

pub use config::{DjinnConfig, LogFormat, SupervisorKind};
pub use error::{ConfigError, ConfigResult};
pub use retry::{Retry, RetryPolicy};
pub use secret::Secret;

use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

/// Boxed future returned by the trait seams between crates.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
