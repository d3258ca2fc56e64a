//! CoordinationClient — the one coordination session a controller owns.
//!
//! Every call goes through the transient-failure loop: on a connection
//! loss or expired session the client reconnects, sleeps one retry
//! interval and runs the same operation again, for as long as it takes.
//! Only an optional per-call deadline bounds that loop. Application errors
//! (`NoNode`, `VersionConflict`, ...) are returned on first sight.
//!
//! Writes made through [`CoordinationClient::write`] additionally survive
//! `OperationTimeout`/`System` failures for a bounded number of attempts;
//! after that they are abandoned with an error log, and the caller is
//! expected to converge on its next pass.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use djinn_core::RetryPolicy;
use djinn_core::config::CoordinationConfig;

use crate::backend::{CoordinationBackend, SessionId};
use crate::error::{CoordError, CoordResult};
use crate::lock::DEFAULT_LOCK_PATH;
use crate::op::{NodeStat, Op, OpReply};
use crate::remote::RemoteBackend;

/// Client tuning. Policies are injectable so tests can run without waits.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long `connect` keeps trying before `ConnectionError`.
    pub connect_wait: Duration,
    pub transient: RetryPolicy,
    pub write: RetryPolicy,
    pub lock: RetryPolicy,
    pub lock_path: String,
    pub op_timeout: Option<Duration>,
    pub keepalive_interval: Duration,
}

impl ClientConfig {
    pub fn from_config(config: &CoordinationConfig) -> Self {
        Self {
            connect_wait: config.connect_wait(),
            transient: config.transient_policy(),
            write: config.write_policy(),
            lock: config.lock_policy(),
            lock_path: DEFAULT_LOCK_PATH.to_string(),
            op_timeout: config.op_timeout(),
            keepalive_interval: config.session_timeout() / 3,
        }
    }

    /// Zero-wait policies and short budgets.
    pub fn for_tests() -> Self {
        Self {
            connect_wait: Duration::from_millis(200),
            transient: RetryPolicy::immediate(),
            write: RetryPolicy::immediate().with_max_attempts(5),
            lock: RetryPolicy::fixed(Duration::from_millis(5))
                .with_max_elapsed(Duration::from_secs(5)),
            lock_path: DEFAULT_LOCK_PATH.to_string(),
            op_timeout: Some(Duration::from_secs(10)),
            keepalive_interval: Duration::from_millis(100),
        }
    }

    pub fn with_lock_policy(mut self, policy: RetryPolicy) -> Self {
        self.lock = policy;
        self
    }

    pub fn with_transient_policy(mut self, policy: RetryPolicy) -> Self {
        self.transient = policy;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.op_timeout = timeout;
        self
    }
}

/// Result of a best-effort write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(NodeStat),
    /// Retries were exhausted; the store may now lag local state.
    Abandoned,
}

struct ActiveSession {
    id: SessionId,
    keepalive_stop: watch::Sender<bool>,
}

pub struct CoordinationClient {
    backend: Arc<dyn CoordinationBackend>,
    config: ClientConfig,
    identity: String,
    session: Mutex<Option<ActiveSession>>,
    reconnects: AtomicU64,
    pub(crate) lock_releases: AtomicU64,
}

impl CoordinationClient {
    /// Wrap a backend. No session is opened until `connect` or first use.
    pub fn new(backend: Arc<dyn CoordinationBackend>, identity: &str, config: ClientConfig) -> Self {
        Self {
            backend,
            config,
            identity: identity.to_string(),
            session: Mutex::new(None),
            reconnects: AtomicU64::new(0),
            lock_releases: AtomicU64::new(0),
        }
    }

    /// Dial coordination servers over HTTP and open a session.
    pub async fn connect_remote(
        endpoints: Vec<String>,
        identity: &str,
        config: ClientConfig,
    ) -> CoordResult<Self> {
        let backend = Arc::new(RemoteBackend::new(endpoints));
        let client = Self::new(backend, identity, config);
        client.connect().await?;
        Ok(client)
    }

    /// Owner token written into locks this client takes.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn lock_release_count(&self) -> u64 {
        self.lock_releases.load(Ordering::SeqCst)
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.session.lock().await.as_ref().map(|s| s.id)
    }

    // ── Session lifecycle ──────────────────────────────────────────

    /// Open a fresh session, closing any prior one first.
    ///
    /// Fails with `ConnectionError` once `connect_wait` has passed without
    /// the service answering.
    pub async fn connect(&self) -> CoordResult<SessionId> {
        let mut slot = self.session.lock().await;
        self.replace_session(&mut slot).await
    }

    async fn replace_session(&self, slot: &mut Option<ActiveSession>) -> CoordResult<SessionId> {
        if let Some(prior) = slot.take() {
            let _ = prior.keepalive_stop.send(true);
            if let Err(e) = self.backend.close_session(prior.id).await {
                debug!(session = prior.id, error = %e, "closing prior session failed");
            }
        }

        let started = Instant::now();
        let mut retry = self.config.transient.start();
        let id = loop {
            match self.backend.open_session().await {
                Ok(id) => break id,
                Err(e) if e.is_transient() => {
                    if started.elapsed() >= self.config.connect_wait {
                        return Err(CoordError::ConnectionError(e.to_string()));
                    }
                    debug!(attempt = retry.attempts(), error = %e, "coordination service not answering yet");
                    let remaining = self.config.connect_wait.saturating_sub(started.elapsed());
                    let pause = retry.next_delay().unwrap_or(remaining).min(remaining);
                    tokio::time::sleep(pause.max(Duration::from_millis(1))).await;
                }
                Err(e) => return Err(e),
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        self.spawn_keepalive(id, stop_rx);
        *slot = Some(ActiveSession {
            id,
            keepalive_stop: stop_tx,
        });
        info!(session = id, identity = %self.identity, "coordination session established");
        Ok(id)
    }

    /// Close the session. Ephemeral nodes it owned, the lock included,
    /// disappear with it.
    pub async fn close(&self) -> CoordResult<()> {
        let mut slot = self.session.lock().await;
        if let Some(active) = slot.take() {
            let _ = active.keepalive_stop.send(true);
            self.backend.close_session(active.id).await?;
            info!(session = active.id, "coordination session closed");
        }
        Ok(())
    }

    fn spawn_keepalive(&self, session: SessionId, mut stop: watch::Receiver<bool>) {
        let backend = Arc::clone(&self.backend);
        let interval = self.config.keepalive_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match backend.keepalive(session).await {
                            Ok(()) => {}
                            Err(CoordError::SessionExpired(_)) => {
                                warn!(session, "session expired; next call will reconnect");
                                break;
                            }
                            Err(e) => debug!(session, error = %e, "keepalive failed"),
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
    }

    async fn current_or_connect(&self) -> CoordResult<SessionId> {
        let mut slot = self.session.lock().await;
        if let Some(active) = slot.as_ref() {
            return Ok(active.id);
        }
        self.replace_session(&mut slot).await
    }

    /// Replace the session that just failed. If another caller already
    /// replaced it, keep theirs.
    async fn reconnect_after(&self, failed: Option<SessionId>) -> CoordResult<()> {
        let mut slot = self.session.lock().await;
        let current = slot.as_ref().map(|s| s.id);
        if current.is_some() && current != failed {
            return Ok(());
        }
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.replace_session(&mut slot).await.map(|_| ())
    }

    // ── Call path ──────────────────────────────────────────────────

    /// Run one operation under the transient-failure loop and the
    /// optional deadline.
    pub async fn execute(&self, op: Op) -> CoordResult<OpReply> {
        match self.config.op_timeout {
            Some(limit) => tokio::time::timeout(limit, self.execute_with_reconnect(op))
                .await
                .map_err(|_| CoordError::Deadline(limit.as_millis() as u64))?,
            None => self.execute_with_reconnect(op).await,
        }
    }

    async fn execute_with_reconnect(&self, op: Op) -> CoordResult<OpReply> {
        let mut retry = self.config.transient.start();
        loop {
            let (used, outcome) = match self.current_or_connect().await {
                Ok(session) => (Some(session), self.backend.execute(session, op.clone()).await),
                Err(CoordError::ConnectionError(reason)) => {
                    (None, Err(CoordError::ConnectionLoss(reason)))
                }
                Err(e) => (None, Err(e)),
            };

            match outcome {
                Err(e) if e.is_transient() => {
                    let Some(pause) = retry.next_delay() else {
                        return Err(e);
                    };
                    warn!(path = op.path(), failures = retry.attempts(), error = %e, "transient coordination failure, reconnecting");
                    tokio::time::sleep(pause).await;
                    if let Err(ce) = self.reconnect_after(used).await {
                        warn!(error = %ce, "reconnect failed");
                    }
                }
                other => return other,
            }
        }
    }

    // ── Operations ─────────────────────────────────────────────────

    pub async fn get(&self, path: &str) -> CoordResult<String> {
        self.get_with_stat(path).await.map(|(value, _)| value)
    }

    pub async fn get_with_stat(&self, path: &str) -> CoordResult<(String, NodeStat)> {
        match self.execute(Op::Get { path: path.to_string() }).await? {
            OpReply::Value { value, stat } => Ok((value, stat)),
            other => Err(unexpected(path, other)),
        }
    }

    /// Create-or-update. A mismatched `expected_version` is a `VersionConflict`.
    pub async fn set(
        &self,
        path: &str,
        value: &str,
        ephemeral: bool,
        expected_version: Option<u64>,
    ) -> CoordResult<NodeStat> {
        let op = Op::Set {
            path: path.to_string(),
            value: value.to_string(),
            ephemeral,
            expected_version,
        };
        match self.execute(op).await? {
            OpReply::Stat { stat } => Ok(stat),
            other => Err(unexpected(path, other)),
        }
    }

    /// Create-if-absent. An existing node is `NodeExists`.
    pub async fn create(&self, path: &str, value: &str, ephemeral: bool) -> CoordResult<NodeStat> {
        let op = Op::Create {
            path: path.to_string(),
            value: value.to_string(),
            ephemeral,
        };
        match self.execute(op).await? {
            OpReply::Stat { stat } => Ok(stat),
            other => Err(unexpected(path, other)),
        }
    }

    pub async fn delete(&self, path: &str) -> CoordResult<()> {
        match self.execute(Op::Delete { path: path.to_string() }).await? {
            OpReply::Deleted => Ok(()),
            other => Err(unexpected(path, other)),
        }
    }

    /// Delete a node and everything under it. Missing nodes are fine.
    pub async fn delete_recursive(&self, path: &str) -> CoordResult<()> {
        let mut stack = vec![path.to_string()];
        let mut order = Vec::new();
        while let Some(current) = stack.pop() {
            match self.children(&current).await {
                Ok(names) => {
                    for name in names {
                        stack.push(join(&current, &name));
                    }
                    order.push(current);
                }
                Err(CoordError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        for node in order.into_iter().rev() {
            match self.delete(&node).await {
                Ok(()) | Err(CoordError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn children(&self, path: &str) -> CoordResult<Vec<String>> {
        match self.execute(Op::Children { path: path.to_string() }).await? {
            OpReply::Children { names } => Ok(names),
            other => Err(unexpected(path, other)),
        }
    }

    pub async fn exists(&self, path: &str) -> CoordResult<bool> {
        match self.execute(Op::Exists { path: path.to_string() }).await? {
            OpReply::Exists { exists } => Ok(exists),
            other => Err(unexpected(path, other)),
        }
    }

    // ── Best-effort writes ─────────────────────────────────────────

    /// Persistent create-or-update with bounded backoff on retryable
    /// failures. Exhaustion is logged and reported as `Abandoned`, never as
    /// an error.
    pub async fn write(&self, path: &str, value: &str) -> CoordResult<WriteOutcome> {
        let mut retry = self.config.write.start();
        loop {
            match self.set(path, value, false, None).await {
                Ok(stat) => return Ok(WriteOutcome::Written(stat)),
                Err(e) if e.is_retryable_write() => {
                    let Some(pause) = retry.next_delay() else {
                        error!(%path, attempts = retry.attempts(), error = %e, "write abandoned after retries");
                        return Ok(WriteOutcome::Abandoned);
                    };
                    debug!(%path, attempts = retry.attempts(), pause_ms = pause.as_millis() as u64, "retrying write");
                    tokio::time::sleep(pause).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write_json<T: Serialize>(&self, path: &str, value: &T) -> CoordResult<WriteOutcome> {
        let text = serde_json::to_string(value).map_err(|e| CoordError::Invalid(e.to_string()))?;
        self.write(path, &text).await
    }

    /// Read and decode a JSON node. `Ok(None)` when it does not exist.
    pub async fn read_json<T: DeserializeOwned>(&self, path: &str) -> CoordResult<Option<T>> {
        match self.get(path).await {
            Ok(text) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| CoordError::Invalid(format!("{path}: {e}"))),
            Err(CoordError::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn unexpected(path: &str, reply: OpReply) -> CoordError {
    CoordError::System(format!("unexpected reply for {path}: {reply:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::CoordinationTree;

    fn setup() -> (CoordinationTree, CoordinationClient) {
        let tree = CoordinationTree::open_in_memory(Duration::from_secs(30)).unwrap();
        let client = CoordinationClient::new(Arc::new(tree.clone()), "10.0.0.1", ClientConfig::for_tests());
        (tree, client)
    }

    #[tokio::test]
    async fn basic_operations() {
        let (_tree, client) = setup();
        client.set("/a/b", "1", false, None).await.unwrap();
        assert_eq!(client.get("/a/b").await.unwrap(), "1");
        assert!(client.exists("/a").await.unwrap());
        assert_eq!(client.children("/a").await.unwrap(), vec!["b"]);
        client.delete("/a/b").await.unwrap();
        assert!(!client.exists("/a/b").await.unwrap());
    }

    #[tokio::test]
    async fn application_errors_are_not_retried() {
        let (tree, client) = setup();
        let before = tree.executed_ops();
        let err = client.get("/missing").await.unwrap_err();
        assert_eq!(err, CoordError::NoNode("/missing".into()));
        // One session open does not count; exactly one op reached the tree.
        assert_eq!(tree.executed_ops() - before, 1);
        assert_eq!(client.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn version_conflict_is_distinct() {
        let (_tree, client) = setup();
        client.set("/v", "a", false, None).await.unwrap();
        let err = client.set("/v", "b", false, Some(7)).await.unwrap_err();
        assert!(matches!(err, CoordError::VersionConflict { expected: 7, actual: 0, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn connection_loss_reconnects_and_retries_same_op() {
        let (tree, client) = setup();
        client.connect().await.unwrap();
        let first = client.session_id().await.unwrap();

        tree.fail_next_calls(3);
        client.set("/k", "v", false, None).await.unwrap();

        assert_eq!(client.get("/k").await.unwrap(), "v");
        assert!(client.reconnect_count() >= 1);
        assert_ne!(client.session_id().await.unwrap(), first);
    }

    #[tokio::test]
    async fn expired_session_reconnects() {
        let (tree, client) = setup();
        let first = client.connect().await.unwrap();
        tree.expire_session(first);
        assert!(client.exists("/").await.unwrap());
        assert!(client.session_id().await.unwrap() != first);
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_closes_prior_session() {
        let (tree, client) = setup();
        client.connect().await.unwrap();
        client.create("/mine", "", true).await.unwrap();
        client.connect().await.unwrap();
        assert_eq!(tree.session_count(), 1);
        // The prior session's ephemeral node went with it.
        assert!(!client.exists("/mine").await.unwrap());
    }

    #[tokio::test]
    async fn connect_fails_after_wait_window() {
        let client = CoordinationClient::connect_remote(
            vec!["127.0.0.1:1".into()],
            "10.0.0.1",
            ClientConfig {
                connect_wait: Duration::from_millis(100),
                ..ClientConfig::for_tests()
            },
        )
        .await;
        assert!(matches!(client, Err(CoordError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn deadline_cancels_endless_retry() {
        let tree = CoordinationTree::open_in_memory(Duration::from_secs(30)).unwrap();
        let config = ClientConfig::for_tests()
            .with_transient_policy(RetryPolicy::fixed(Duration::from_millis(5)))
            .with_op_timeout(Some(Duration::from_millis(100)));
        let client = CoordinationClient::new(Arc::new(tree.clone()), "10.0.0.1", config);
        client.connect().await.unwrap();

        tree.fail_next_calls(u32::MAX);
        let err = client.get("/").await.unwrap_err();
        assert_eq!(err, CoordError::Deadline(100));
    }

    #[tokio::test]
    async fn write_retries_then_succeeds() {
        let (tree, client) = setup();
        tree.fail_next_writes(4);
        let outcome = client.write("/w", "x").await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Written(_)));
    }

    #[tokio::test]
    async fn write_abandoned_after_five_attempts() {
        let (tree, client) = setup();
        tree.fail_next_writes(5);
        let outcome = client.write("/w", "x").await.unwrap();
        assert_eq!(outcome, WriteOutcome::Abandoned);
        assert!(!client.exists("/w").await.unwrap());
    }

    #[tokio::test]
    async fn json_helpers() {
        let (_tree, client) = setup();
        assert_eq!(client.read_json::<Vec<u32>>("/j").await.unwrap(), None);
        client.write_json("/j", &vec![1u32, 2]).await.unwrap();
        assert_eq!(client.read_json::<Vec<u32>>("/j").await.unwrap(), Some(vec![1, 2]));
    }

    #[tokio::test]
    async fn delete_recursive_clears_subtree() {
        let (_tree, client) = setup();
        client.set("/r/a/1", "", false, None).await.unwrap();
        client.set("/r/b", "", false, None).await.unwrap();
        client.delete_recursive("/r").await.unwrap();
        assert!(!client.exists("/r").await.unwrap());
        client.delete_recursive("/r").await.unwrap();
    }
}
