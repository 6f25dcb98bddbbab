//! redb table definitions for the ServGrid store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Service tasks keyed by task name.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Group configurations keyed by group name.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Last known node records keyed by node id.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
