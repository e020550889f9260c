//! Persisted record types.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{CellId, Millis, OperationId, ResourceVector, TabletId};

/// Rows of one tablet, ordered by key.
pub type TabletRows = BTreeMap<String, Value>;

/// A mutation applied to one tablet of a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
    /// The tablet was mounted on the cell with these initial rows.
    MountTablet { rows: TabletRows },
    /// The tablet left the cell; its rows were flushed back to the table.
    UnmountTablet,
    Write { key: String, value: Value },
    Delete { key: String },
}

/// One committed changelog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogRecord {
    pub seq: u64,
    pub tablet_id: TabletId,
    pub mutation: Mutation,
    pub timestamp: Millis,
}

impl ChangelogRecord {
    /// Apply this record to an in-memory tablet map.
    pub fn apply(&self, tablets: &mut BTreeMap<TabletId, TabletRows>) {
        match &self.mutation {
            Mutation::MountTablet { rows } => {
                tablets.insert(self.tablet_id, rows.clone());
            }
            Mutation::UnmountTablet => {
                tablets.remove(&self.tablet_id);
            }
            Mutation::Write { key, value } => {
                if let Some(rows) = tablets.get_mut(&self.tablet_id) {
                    rows.insert(key.clone(), value.clone());
                }
            }
            Mutation::Delete { key } => {
                if let Some(rows) = tablets.get_mut(&self.tablet_id) {
                    rows.remove(key);
                }
            }
        }
    }
}

/// Compacted cell state as of `seq` (inclusive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub cell_id: CellId,
    pub snapshot_id: u64,
    pub seq: u64,
    pub tablets: BTreeMap<TabletId, TabletRows>,
}

/// Accumulated per-pool state that must survive restart, moves and renames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStateRecord {
    pub historic_usage: ResourceVector,
    pub integral_volume: ResourceVector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralPoolRecord {
    pub user: String,
    pub parent: String,
}

/// Scheduler side snapshot for one pool tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FairShareSnapshot {
    pub tree: String,
    pub taken_at: Millis,
    pub pools: BTreeMap<String, PoolStateRecord>,
    pub ephemeral_pools: BTreeMap<String, EphemeralPoolRecord>,
    pub user_ephemeral_pools: BTreeMap<String, BTreeSet<String>>,
    pub operation_segments: BTreeMap<OperationId, String>,
}
