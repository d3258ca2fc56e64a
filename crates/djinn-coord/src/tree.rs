//! CoordinationTree — the store behind every backend.
//!
//! Nodes live in an in-memory `BTreeMap` keyed by absolute path so that
//! children are a prefix scan. Persistent nodes are written through to
//! redb; ephemeral nodes exist only in memory and are dropped with the
//! session that created them. Sessions expire when no call or keepalive
//! has been seen for `session_timeout`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use djinn_core::BoxFuture;

use crate::backend::{CoordinationBackend, SessionId};
use crate::error::{CoordError, CoordResult};
use crate::op::{NodeStat, Op, OpReply};
use crate::tables::TREE_NODES;

macro_rules! map_err {
    () => {
        |e| CoordError::System(e.to_string())
    };
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TreeNode {
    value: String,
    version: u64,
    mtime_ms: u64,
    #[serde(skip)]
    ephemeral_owner: Option<SessionId>,
}

impl TreeNode {
    fn new(value: String, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            value,
            version: 0,
            mtime_ms: djinn_core::epoch_millis(),
            ephemeral_owner,
        }
    }

    fn stat(&self) -> NodeStat {
        NodeStat {
            version: self.version,
            mtime_ms: self.mtime_ms,
            ephemeral_owner: self.ephemeral_owner,
        }
    }
}

struct TreeState {
    nodes: BTreeMap<String, TreeNode>,
    sessions: HashMap<SessionId, Instant>,
    next_session: SessionId,
}

#[derive(Default)]
struct Faults {
    connection_losses: AtomicU32,
    write_failures: AtomicU32,
    executed: AtomicU64,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Thread-safe coordination tree. Cheap to clone.
#[derive(Clone)]
pub struct CoordinationTree {
    db: Arc<Database>,
    state: Arc<Mutex<TreeState>>,
    session_timeout: Duration,
    faults: Arc<Faults>,
}

impl CoordinationTree {
    /// Open (or create) a tree persisted at `path`.
    pub fn open(path: &Path, session_timeout: Duration) -> CoordResult<Self> {
        let db = Database::create(path).map_err(map_err!())?;
        let tree = Self::from_database(db, session_timeout)?;
        info!(?path, nodes = tree.node_count(), "coordination tree opened");
        Ok(tree)
    }

    /// Create a tree backed by memory only (for testing and single-node runs).
    pub fn open_in_memory(session_timeout: Duration) -> CoordResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!())?;
        let tree = Self::from_database(db, session_timeout)?;
        debug!("in-memory coordination tree opened");
        Ok(tree)
    }

    fn from_database(db: Database, session_timeout: Duration) -> CoordResult<Self> {
        let txn = db.begin_write().map_err(map_err!())?;
        txn.open_table(TREE_NODES).map_err(map_err!())?;
        txn.commit().map_err(map_err!())?;

        let mut nodes = BTreeMap::new();
        {
            let txn = db.begin_read().map_err(map_err!())?;
            let table = txn.open_table(TREE_NODES).map_err(map_err!())?;
            for entry in table.iter().map_err(map_err!())? {
                let (key, value) = entry.map_err(map_err!())?;
                let node: TreeNode = serde_json::from_slice(value.value()).map_err(map_err!())?;
                nodes.insert(key.value().to_string(), node);
            }
        }
        nodes
            .entry("/".to_string())
            .or_insert_with(|| TreeNode::new(String::new(), None));

        Ok(Self {
            db: Arc::new(db),
            state: Arc::new(Mutex::new(TreeState {
                nodes,
                sessions: HashMap::new(),
                next_session: 1,
            })),
            session_timeout,
            faults: Arc::new(Faults::default()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ── Fault injection ────────────────────────────────────────────

    /// Make the next `n` calls fail with a connection loss.
    pub fn fail_next_calls(&self, n: u32) {
        self.faults.connection_losses.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` writes fail with a system error.
    pub fn fail_next_writes(&self, n: u32) {
        self.faults.write_failures.store(n, Ordering::SeqCst);
    }

    /// Operations that reached the tree (injected connection losses excluded).
    pub fn executed_ops(&self) -> u64 {
        self.faults.executed.load(Ordering::SeqCst)
    }

    // ── Sessions ───────────────────────────────────────────────────

    pub fn create_session(&self) -> SessionId {
        let mut st = self.lock_state();
        self.reap_locked(&mut st);
        let id = st.next_session;
        st.next_session += 1;
        st.sessions.insert(id, Instant::now());
        debug!(session = id, "session opened");
        id
    }

    pub fn touch_session(&self, session: SessionId) -> CoordResult<()> {
        let mut st = self.lock_state();
        self.reap_locked(&mut st);
        match st.sessions.get_mut(&session) {
            Some(seen) => {
                *seen = Instant::now();
                Ok(())
            }
            None => Err(CoordError::SessionExpired(session)),
        }
    }

    /// End a session and drop its ephemeral nodes. Unknown sessions are ignored.
    pub fn end_session(&self, session: SessionId) {
        let mut st = self.lock_state();
        Self::drop_session(&mut st, session);
    }

    /// Force a session to expire, as if its keepalives had stopped.
    pub fn expire_session(&self, session: SessionId) {
        self.end_session(session);
        info!(session, "session expired");
    }

    /// Expire every session idle past the timeout. Returns how many ended.
    pub fn reap_expired(&self) -> usize {
        let mut st = self.lock_state();
        self.reap_locked(&mut st)
    }

    fn reap_locked(&self, st: &mut TreeState) -> usize {
        let timeout = self.session_timeout;
        let expired: Vec<SessionId> = st
            .sessions
            .iter()
            .filter(|(_, seen)| seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            Self::drop_session(st, *id);
            info!(session = id, "session expired without keepalive");
        }
        expired.len()
    }

    fn drop_session(st: &mut TreeState, session: SessionId) {
        if st.sessions.remove(&session).is_none() {
            return;
        }
        let owned: Vec<String> = st
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        for path in owned {
            st.nodes.remove(&path);
            debug!(%path, session, "ephemeral node removed");
        }
    }

    pub fn session_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    pub fn node_count(&self) -> usize {
        self.lock_state().nodes.len()
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Apply one operation on behalf of a session.
    pub fn apply(&self, session: SessionId, op: Op) -> CoordResult<OpReply> {
        if take_one(&self.faults.connection_losses) {
            return Err(CoordError::ConnectionLoss("injected fault".to_string()));
        }
        self.faults.executed.fetch_add(1, Ordering::SeqCst);

        let mut st = self.lock_state();
        self.reap_locked(&mut st);
        match st.sessions.get_mut(&session) {
            Some(seen) => *seen = Instant::now(),
            None => return Err(CoordError::SessionExpired(session)),
        }

        validate_path(op.path())?;
        if op.is_write() && take_one(&self.faults.write_failures) {
            return Err(CoordError::System("injected write failure".to_string()));
        }

        match op {
            Op::Get { path } => st
                .nodes
                .get(&path)
                .map(|n| OpReply::Value {
                    value: n.value.clone(),
                    stat: n.stat(),
                })
                .ok_or(CoordError::NoNode(path)),

            Op::Exists { path } => Ok(OpReply::Exists {
                exists: st.nodes.contains_key(&path),
            }),

            Op::Children { path } => {
                if !st.nodes.contains_key(&path) {
                    return Err(CoordError::NoNode(path));
                }
                Ok(OpReply::Children {
                    names: child_names(&st.nodes, &path),
                })
            }

            Op::Create {
                path,
                value,
                ephemeral,
            } => {
                if st.nodes.contains_key(&path) {
                    return Err(CoordError::NodeExists(path));
                }
                self.create_node(&mut st, session, &path, value, ephemeral)
            }

            Op::Set {
                path,
                value,
                ephemeral,
                expected_version,
            } => match st.nodes.get(&path) {
                None => match expected_version {
                    Some(_) => Err(CoordError::NoNode(path)),
                    None => self.create_node(&mut st, session, &path, value, ephemeral),
                },
                Some(existing) => {
                    if let Some(expected) = expected_version
                        && expected != existing.version
                    {
                        return Err(CoordError::VersionConflict {
                            path,
                            expected,
                            actual: existing.version,
                        });
                    }
                    let mut updated = existing.clone();
                    updated.value = value;
                    updated.version += 1;
                    updated.mtime_ms = djinn_core::epoch_millis();
                    self.persist(&path, Some(&updated))?;
                    let stat = updated.stat();
                    st.nodes.insert(path, updated);
                    Ok(OpReply::Stat { stat })
                }
            },

            Op::Delete { path } => {
                if path == "/" {
                    return Err(CoordError::Invalid("cannot delete the root".to_string()));
                }
                let Some(existing) = st.nodes.get(&path) else {
                    return Err(CoordError::NoNode(path));
                };
                if !child_names(&st.nodes, &path).is_empty() {
                    return Err(CoordError::NotEmpty(path));
                }
                if existing.ephemeral_owner.is_none() {
                    self.persist(&path, None)?;
                }
                st.nodes.remove(&path);
                Ok(OpReply::Deleted)
            }
        }
    }

    fn create_node(
        &self,
        st: &mut TreeState,
        session: SessionId,
        path: &str,
        value: String,
        ephemeral: bool,
    ) -> CoordResult<OpReply> {
        // Ancestors are created persistent and empty, top down.
        let mut missing = Vec::new();
        let mut cursor = parent_of(path);
        while let Some(parent) = cursor {
            match st.nodes.get(parent) {
                Some(node) if node.ephemeral_owner.is_some() => {
                    return Err(CoordError::Invalid(format!(
                        "ephemeral node {parent} cannot have children"
                    )));
                }
                Some(_) => break,
                None => missing.push(parent.to_string()),
            }
            cursor = parent_of(parent);
        }
        for parent in missing.into_iter().rev() {
            let node = TreeNode::new(String::new(), None);
            self.persist(&parent, Some(&node))?;
            st.nodes.insert(parent, node);
        }

        let node = TreeNode::new(value, ephemeral.then_some(session));
        if !ephemeral {
            self.persist(path, Some(&node))?;
        }
        let stat = node.stat();
        st.nodes.insert(path.to_string(), node);
        Ok(OpReply::Stat { stat })
    }

    /// Write a persistent node through to redb, or remove it with `None`.
    fn persist(&self, path: &str, node: Option<&TreeNode>) -> CoordResult<()> {
        if node.is_some_and(|n| n.ephemeral_owner.is_some()) {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!())?;
        {
            let mut table = txn.open_table(TREE_NODES).map_err(map_err!())?;
            match node {
                Some(node) => {
                    let bytes = serde_json::to_vec(node).map_err(map_err!())?;
                    table
                        .insert(path, bytes.as_slice())
                        .map_err(map_err!())?;
                }
                None => {
                    table.remove(path).map_err(map_err!())?;
                }
            }
        }
        txn.commit().map_err(map_err!())?;
        Ok(())
    }
}

impl CoordinationBackend for CoordinationTree {
    fn open_session(&self) -> BoxFuture<'_, CoordResult<SessionId>> {
        Box::pin(async move {
            if take_one(&self.faults.connection_losses) {
                return Err(CoordError::ConnectionLoss("injected fault".to_string()));
            }
            Ok(self.create_session())
        })
    }

    fn keepalive(&self, session: SessionId) -> BoxFuture<'_, CoordResult<()>> {
        Box::pin(async move { self.touch_session(session) })
    }

    fn close_session(&self, session: SessionId) -> BoxFuture<'_, CoordResult<()>> {
        Box::pin(async move {
            self.end_session(session);
            Ok(())
        })
    }

    fn execute(&self, session: SessionId, op: Op) -> BoxFuture<'_, CoordResult<OpReply>> {
        Box::pin(async move { self.apply(session, op) })
    }
}

fn validate_path(path: &str) -> CoordResult<()> {
    let ok = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//")
        && !path.contains('\0');
    if ok {
        Ok(())
    } else {
        Err(CoordError::Invalid(format!("bad path {path:?}")))
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

fn child_names(nodes: &BTreeMap<String, TreeNode>, path: &str) -> Vec<String> {
    let prefix = if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    };
    nodes
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .filter_map(|(k, _)| {
            let rest = &k[prefix.len()..];
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> CoordinationTree {
        CoordinationTree::open_in_memory(Duration::from_secs(30)).unwrap()
    }

    fn set(path: &str, value: &str) -> Op {
        Op::Set {
            path: path.to_string(),
            value: value.to_string(),
            ephemeral: false,
            expected_version: None,
        }
    }

    fn get(path: &str) -> Op {
        Op::Get {
            path: path.to_string(),
        }
    }

    #[test]
    fn set_creates_parents_and_get_reads_back() {
        let t = tree();
        let s = t.create_session();
        t.apply(s, set("/a/b/c", "v")).unwrap();

        match t.apply(s, get("/a/b/c")).unwrap() {
            OpReply::Value { value, stat } => {
                assert_eq!(value, "v");
                assert_eq!(stat.version, 0);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(
            t.apply(s, Op::Children { path: "/a".into() }).unwrap(),
            OpReply::Children {
                names: vec!["b".into()]
            }
        );
    }

    #[test]
    fn versions_increment_and_conflict() {
        let t = tree();
        let s = t.create_session();
        t.apply(s, set("/k", "1")).unwrap();
        t.apply(s, set("/k", "2")).unwrap();

        let stale = Op::Set {
            path: "/k".into(),
            value: "3".into(),
            ephemeral: false,
            expected_version: Some(0),
        };
        assert_eq!(
            t.apply(s, stale).unwrap_err(),
            CoordError::VersionConflict {
                path: "/k".into(),
                expected: 0,
                actual: 1
            }
        );

        let fresh = Op::Set {
            path: "/k".into(),
            value: "3".into(),
            ephemeral: false,
            expected_version: Some(1),
        };
        assert!(t.apply(s, fresh).is_ok());
    }

    #[test]
    fn versioned_set_on_missing_node_is_no_node() {
        let t = tree();
        let s = t.create_session();
        let op = Op::Set {
            path: "/missing".into(),
            value: "x".into(),
            ephemeral: false,
            expected_version: Some(0),
        };
        assert!(matches!(t.apply(s, op), Err(CoordError::NoNode(_))));
    }

    #[test]
    fn create_fails_when_present() {
        let t = tree();
        let s = t.create_session();
        let op = Op::Create {
            path: "/lock".into(),
            value: "me".into(),
            ephemeral: true,
        };
        t.apply(s, op.clone()).unwrap();
        assert_eq!(
            t.apply(s, op).unwrap_err(),
            CoordError::NodeExists("/lock".into())
        );
    }

    #[test]
    fn ephemeral_nodes_die_with_session() {
        let t = tree();
        let owner = t.create_session();
        let reader = t.create_session();
        t.apply(
            owner,
            Op::Create {
                path: "/nodes/10.0.0.1/live".into(),
                value: String::new(),
                ephemeral: true,
            },
        )
        .unwrap();

        t.expire_session(owner);
        assert_eq!(
            t.apply(reader, Op::Exists { path: "/nodes/10.0.0.1/live".into() })
                .unwrap(),
            OpReply::Exists { exists: false }
        );
        // Parent placeholder is persistent and survives.
        assert_eq!(
            t.apply(reader, Op::Exists { path: "/nodes/10.0.0.1".into() })
                .unwrap(),
            OpReply::Exists { exists: true }
        );
        assert_eq!(
            t.apply(owner, get("/")).unwrap_err(),
            CoordError::SessionExpired(owner)
        );
    }

    #[test]
    fn idle_sessions_are_reaped() {
        let t = CoordinationTree::open_in_memory(Duration::from_millis(10)).unwrap();
        let s = t.create_session();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(t.reap_expired(), 1);
        assert!(matches!(t.touch_session(s), Err(CoordError::SessionExpired(_))));
    }

    #[test]
    fn delete_requires_empty_node() {
        let t = tree();
        let s = t.create_session();
        t.apply(s, set("/p/c", "")).unwrap();
        assert_eq!(
            t.apply(s, Op::Delete { path: "/p".into() }).unwrap_err(),
            CoordError::NotEmpty("/p".into())
        );
        t.apply(s, Op::Delete { path: "/p/c".into() }).unwrap();
        t.apply(s, Op::Delete { path: "/p".into() }).unwrap();
        assert!(matches!(
            t.apply(s, Op::Delete { path: "/p".into() }),
            Err(CoordError::NoNode(_))
        ));
    }

    #[test]
    fn ephemeral_parent_rejects_children() {
        let t = tree();
        let s = t.create_session();
        t.apply(
            s,
            Op::Create {
                path: "/e".into(),
                value: String::new(),
                ephemeral: true,
            },
        )
        .unwrap();
        assert!(matches!(t.apply(s, set("/e/x", "")), Err(CoordError::Invalid(_))));
    }

    #[test]
    fn bad_paths_rejected() {
        let t = tree();
        let s = t.create_session();
        for path in ["relative", "/trailing/", "/double//slash"] {
            assert!(matches!(t.apply(s, get(path)), Err(CoordError::Invalid(_))), "{path}");
        }
    }

    #[test]
    fn injected_faults_are_consumed() {
        let t = tree();
        let s = t.create_session();
        t.fail_next_calls(2);
        assert!(t.apply(s, get("/")).unwrap_err().is_transient());
        assert!(t.apply(s, get("/")).unwrap_err().is_transient());
        assert!(t.apply(s, get("/")).is_ok());

        t.fail_next_writes(1);
        assert!(t.apply(s, set("/w", "1")).unwrap_err().is_retryable_write());
        assert!(t.apply(s, set("/w", "1")).is_ok());
    }

    #[test]
    fn persistent_nodes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coord.redb");
        {
            let t = CoordinationTree::open(&path, Duration::from_secs(30)).unwrap();
            let s = t.create_session();
            t.apply(s, set("/appcontroller/params", "{}")).unwrap();
            t.apply(
                s,
                Op::Create {
                    path: "/appcontroller/lock".into(),
                    value: "me".into(),
                    ephemeral: true,
                },
            )
            .unwrap();
            t.apply(s, set("/gone", "")).unwrap();
            t.apply(s, Op::Delete { path: "/gone".into() }).unwrap();
        }
        let t = CoordinationTree::open(&path, Duration::from_secs(30)).unwrap();
        let s = t.create_session();
        assert!(matches!(
            t.apply(s, get("/appcontroller/params")).unwrap(),
            OpReply::Value { .. }
        ));
        assert!(matches!(
            t.apply(s, get("/appcontroller/lock")),
            Err(CoordError::NoNode(_))
        ));
        assert!(matches!(t.apply(s, get("/gone")), Err(CoordError::NoNode(_))));
    }

    #[test]
    fn parent_paths() {
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/a/b"), Some("/a"));
        assert_eq!(parent_of("/"), None);
    }
}
