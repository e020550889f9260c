//! redb table definitions for the Tessera state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized types).

use redb::TableDefinition;

/// Row mutations keyed by `{cell_id}/{seq:020}` so a prefix scan yields
/// them in sequence order.
pub const CELL_CHANGELOG: TableDefinition<&str, &[u8]> = TableDefinition::new("cell_changelog");

/// Latest compacted snapshot keyed by `{cell_id}`.
pub const CELL_SNAPSHOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("cell_snapshots");

/// Fair-share side snapshot keyed by pool tree name.
pub const SCHEDULER_SNAPSHOTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("scheduler_snapshots");

pub fn changelog_key(cell_id: &str, seq: u64) -> String {
    format!("{cell_id}/{seq:020}")
}

pub fn changelog_prefix(cell_id: &str) -> String {
    format!("{cell_id}/")
}
