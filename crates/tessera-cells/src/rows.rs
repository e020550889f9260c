//! Per-cell tablet rows.
//!
//! The persisted changelog plus snapshot in [`StateStore`] is the source of
//! truth; the in-memory copy here is a cache that the leading peer rebuilds
//! on demand. Dropping the cache (leader change, prerequisite transaction
//! abort) therefore never loses data.

use std::collections::{BTreeMap, HashMap};

use tessera_core::{CellId, Millis, TabletId};
use tessera_state::{CellSnapshot, ChangelogRecord, Mutation, StateStore, TabletRows};
use tracing::{debug, info};

use crate::error::CellResult;

#[derive(Debug, Default)]
struct CellRows {
    seq: u64,
    tablets: BTreeMap<TabletId, TabletRows>,
    records_since_snapshot: u64,
}

pub struct RowStore {
    state: StateStore,
    cells: HashMap<CellId, CellRows>,
    snapshot_threshold: u64,
}

impl RowStore {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            cells: HashMap::new(),
            snapshot_threshold: 1_000,
        }
    }

    /// Build a snapshot after this many changelog records.
    pub fn with_snapshot_threshold(mut self, records: u64) -> Self {
        self.snapshot_threshold = records.max(1);
        self
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    fn load(&mut self, cell_id: CellId) -> CellResult<&mut CellRows> {
        if !self.cells.contains_key(&cell_id) {
            let (seq, tablets) = self.state.recover_cell(&cell_id.to_string())?;
            debug!(%cell_id, seq, "cell rows loaded from changelog");
            self.cells.insert(
                cell_id,
                CellRows {
                    seq,
                    tablets,
                    records_since_snapshot: 0,
                },
            );
        }
        Ok(self
            .cells
            .entry(cell_id)
            .or_default())
    }

    /// Persist and apply mutations. Returns the last sequence number.
    pub fn commit(
        &mut self,
        cell_id: CellId,
        mutations: Vec<(TabletId, Mutation)>,
        now: Millis,
    ) -> CellResult<u64> {
        let state = self.state.clone();
        let rows = self.load(cell_id)?;
        let records: Vec<ChangelogRecord> = mutations
            .into_iter()
            .enumerate()
            .map(|(i, (tablet_id, mutation))| ChangelogRecord {
                seq: rows.seq + 1 + i as u64,
                tablet_id,
                mutation,
                timestamp: now,
            })
            .collect();
        state.append_changelog(&cell_id.to_string(), &records)?;
        for record in &records {
            record.apply(&mut rows.tablets);
        }
        rows.seq += records.len() as u64;
        rows.records_since_snapshot += records.len() as u64;
        Ok(rows.seq)
    }

    /// Rows of a tablet hosted by the cell, if present.
    pub fn tablet_rows(&mut self, cell_id: CellId, tablet_id: TabletId) -> CellResult<Option<&TabletRows>> {
        let rows = self.load(cell_id)?;
        Ok(rows.tablets.get(&tablet_id))
    }

    pub fn last_seq(&mut self, cell_id: CellId) -> CellResult<u64> {
        Ok(self.load(cell_id)?.seq)
    }

    /// Whether enough records accumulated to warrant a snapshot.
    pub fn wants_snapshot(&self, cell_id: CellId) -> bool {
        self.cells
            .get(&cell_id)
            .is_some_and(|c| c.records_since_snapshot >= self.snapshot_threshold)
    }

    /// Compact the cell's changelog into a snapshot. Returns its sequence number.
    pub fn build_snapshot(&mut self, cell_id: CellId, snapshot_id: u64) -> CellResult<u64> {
        let state = self.state.clone();
        let rows = self.load(cell_id)?;
        let snapshot = CellSnapshot {
            cell_id,
            snapshot_id,
            seq: rows.seq,
            tablets: rows.tablets.clone(),
        };
        state.put_snapshot(&snapshot)?;
        rows.records_since_snapshot = 0;
        info!(%cell_id, snapshot_id, seq = snapshot.seq, "cell snapshot built");
        Ok(snapshot.seq)
    }

    /// Drop the cached copy; the next access replays persisted state.
    pub fn invalidate(&mut self, cell_id: CellId) {
        if self.cells.remove(&cell_id).is_some() {
            debug!(%cell_id, "cell row cache dropped");
        }
    }

    pub fn remove_cell(&mut self, cell_id: CellId) -> CellResult<()> {
        self.cells.remove(&cell_id);
        self.state.remove_cell_data(&cell_id.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_loss_recovers_from_changelog_and_snapshot() {
        let mut rows = RowStore::new(StateStore::open_in_memory().unwrap()).with_snapshot_threshold(2);
        let cell = CellId::new();
        let tablet = TabletId::new();
        rows.commit(cell, vec![(tablet, Mutation::MountTablet { rows: TabletRows::new() })], 0)
            .unwrap();
        rows.commit(
            cell,
            vec![
                (tablet, Mutation::Write { key: "a".into(), value: json!(1) }),
                (tablet, Mutation::Write { key: "b".into(), value: json!(2) }),
            ],
            1,
        )
        .unwrap();
        assert!(rows.wants_snapshot(cell));
        assert_eq!(rows.build_snapshot(cell, 1).unwrap(), 3);
        rows.commit(cell, vec![(tablet, Mutation::Delete { key: "a".into() })], 2)
            .unwrap();

        rows.invalidate(cell);
        let recovered = rows.tablet_rows(cell, tablet).unwrap().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered["b"], json!(2));
        assert_eq!(rows.last_seq(cell).unwrap(), 4);
    }
}
