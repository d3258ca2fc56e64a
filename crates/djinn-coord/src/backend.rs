//! The seam between the client and whatever stores the tree.

use djinn_core::BoxFuture;

use crate::error::CoordResult;
use crate::op::{Op, OpReply};

pub type SessionId = u64;

/// A coordination service reachable by session.
///
/// Ephemeral nodes created through a session disappear when the session
/// is closed or expires for lack of keepalives.
pub trait CoordinationBackend: Send + Sync {
    fn open_session(&self) -> BoxFuture<'_, CoordResult<SessionId>>;

    fn keepalive(&self, session: SessionId) -> BoxFuture<'_, CoordResult<()>>;

    fn close_session(&self, session: SessionId) -> BoxFuture<'_, CoordResult<()>>;

    fn execute(&self, session: SessionId, op: Op) -> BoxFuture<'_, CoordResult<OpReply>>;
}
