//! The cluster-wide lock.
//!
//! An ephemeral node at a well-known path whose value is the holder's
//! [`LockToken`]. Taking the lock is create-if-absent; a `NodeExists`
//! answer is not a failure but a prompt to read the token. If the token
//! names this client the lock is already ours (re-entrant call) and is
//! left alone; otherwise we wait and try again, within the lock policy's
//! budget. A holder that crashes loses its session and with it the lock.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::CoordinationClient;
use crate::error::{CoordError, CoordResult};

pub const DEFAULT_LOCK_PATH: &str = "/appcontroller/lock";

/// Value stored in the lock node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub owner: String,
    pub acquired_at: u64,
}

impl LockToken {
    fn decode(raw: &str) -> LockToken {
        // Older holders wrote the bare owner string.
        serde_json::from_str(raw).unwrap_or_else(|_| LockToken {
            owner: raw.to_string(),
            acquired_at: 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAcquisition {
    /// This call created the lock node and must release it.
    Acquired,
    /// The lock already belonged to this client.
    AlreadyHeld,
}

impl CoordinationClient {
    /// Take the lock, waiting for the current holder if there is one.
    ///
    /// Gives up with `LockTimeout` once the lock policy's budget is spent.
    pub async fn acquire_lock(&self) -> CoordResult<LockAcquisition> {
        let path = self.config().lock_path.clone();
        let policy = self.config().lock.clone();
        let token = LockToken {
            owner: self.identity().to_string(),
            acquired_at: djinn_core::epoch_secs(),
        };
        let value = serde_json::to_string(&token).map_err(|e| CoordError::Invalid(e.to_string()))?;

        let started = Instant::now();
        let mut retry = policy.start();
        loop {
            match self.create(&path, &value, true).await {
                Ok(_) => {
                    debug!(%path, owner = %token.owner, attempts = retry.attempts(), "lock acquired");
                    return Ok(LockAcquisition::Acquired);
                }
                Err(CoordError::NodeExists(_)) => match self.get(&path).await {
                    Ok(raw) => {
                        let holder = LockToken::decode(&raw);
                        if holder.owner == token.owner {
                            debug!(%path, "lock already held by this controller");
                            return Ok(LockAcquisition::AlreadyHeld);
                        }
                        debug!(%path, holder = %holder.owner, "lock held elsewhere, waiting");
                    }
                    // Released between our create and our read.
                    Err(CoordError::NoNode(_)) => continue,
                    Err(e) => return Err(e),
                },
                Err(e) => return Err(e),
            }

            let Some(pause) = retry.next_delay() else {
                warn!(%path, attempts = retry.attempts(), "gave up waiting for the lock");
                return Err(CoordError::LockTimeout(started.elapsed().as_millis() as u64));
            };
            tokio::time::sleep(pause).await;
        }
    }

    /// Delete the lock node. A node someone else already removed counts
    /// as released.
    pub async fn release_lock(&self) -> CoordResult<()> {
        let path = self.config().lock_path.clone();
        self.lock_releases.fetch_add(1, Ordering::SeqCst);
        match self.delete(&path).await {
            Ok(()) => {
                debug!(%path, "lock released");
                Ok(())
            }
            Err(CoordError::NoNode(_)) => {
                info!(%path, "lock already gone at release");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run `f` with the lock held.
    ///
    /// The lock is released on every exit path of `f`, errors included,
    /// but only when this call was the one that took it.
    pub async fn lock_and_run<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoordError>,
    {
        let acquisition = self.acquire_lock().await?;
        let result = f().await;
        if acquisition == LockAcquisition::Acquired
            && let Err(e) = self.release_lock().await
        {
            warn!(error = %e, "failed to release the lock; it lapses with the session");
        }
        result
    }
}
