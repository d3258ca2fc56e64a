//! redb table definitions for the persisted coordination tree.

use redb::TableDefinition;

/// Persistent tree nodes keyed by absolute path. Ephemeral nodes are
/// never written here.
pub const TREE_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("tree_nodes");
