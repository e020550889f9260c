//! StateStore — redb-backed persistence for Tessera.
//!
//! Cells append row mutations to their changelog and periodically compact
//! it into a snapshot; recovery replays the snapshot plus the changelog
//! tail. The scheduler stores one fair-share side snapshot per pool tree.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tessera_core::TabletId;
use tracing::debug;

use crate::error::{DbStage, StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Closure mapping a redb or serde_json error into a `StateError`.
macro_rules! map_err {
    (Serialize) => {
        |e| StateError::Codec { direction: "encode", message: e.to_string() }
    };
    (Deserialize) => {
        |e| StateError::Codec { direction: "decode", message: e.to_string() }
    };
    ($stage:ident) => {
        |e| StateError::Database { stage: DbStage::$stage, message: e.to_string() }
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(CELL_CHANGELOG).map_err(map_err!(Table))?;
        txn.open_table(CELL_SNAPSHOTS).map_err(map_err!(Table))?;
        txn.open_table(SCHEDULER_SNAPSHOTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Cell changelog ─────────────────────────────────────────────

    /// Append committed mutations for a cell in one transaction.
    pub fn append_changelog(&self, cell_id: &str, records: &[ChangelogRecord]) -> StateResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CELL_CHANGELOG).map_err(map_err!(Table))?;
            for record in records {
                let key = changelog_key(cell_id, record.seq);
                let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%cell_id, count = records.len(), "changelog appended");
        Ok(())
    }

    /// Read changelog records with `seq > after_seq`, in sequence order.
    ///
    /// Fails with `ChangelogGap` if the tail is not contiguous.
    pub fn read_changelog(&self, cell_id: &str, after_seq: u64) -> StateResult<Vec<ChangelogRecord>> {
        let prefix = changelog_prefix(cell_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CELL_CHANGELOG).map_err(map_err!(Table))?;
        let mut results: Vec<ChangelogRecord> = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let record: ChangelogRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if record.seq <= after_seq {
                continue;
            }
            let expected = results.last().map_or(after_seq + 1, |r| r.seq + 1);
            if record.seq != expected {
                return Err(StateError::ChangelogGap {
                    cell: cell_id.to_string(),
                    expected,
                    got: record.seq,
                });
            }
            results.push(record);
        }
        Ok(results)
    }

    /// Highest persisted changelog sequence number for a cell (0 if none).
    pub fn last_changelog_seq(&self, cell_id: &str) -> StateResult<u64> {
        let prefix = changelog_prefix(cell_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CELL_CHANGELOG).map_err(map_err!(Table))?;
        let mut last = 0;
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: ChangelogRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                last = last.max(record.seq);
            }
        }
        Ok(last)
    }

    /// Delete changelog records with `seq <= up_to_seq`. Returns number deleted.
    pub fn truncate_changelog(&self, cell_id: &str, up_to_seq: u64) -> StateResult<u32> {
        let prefix = changelog_prefix(cell_id);
        let bound = changelog_key(cell_id, up_to_seq);
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(CELL_CHANGELOG).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    (k.starts_with(&prefix) && k <= bound).then_some(k)
                })
                .collect()
        };
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(CELL_CHANGELOG).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%cell_id, up_to_seq, count, "changelog truncated");
        Ok(count)
    }

    // ── Cell snapshots ─────────────────────────────────────────────

    /// Store a snapshot and drop the changelog prefix it covers.
    pub fn put_snapshot(&self, snapshot: &CellSnapshot) -> StateResult<()> {
        let key = snapshot.cell_id.to_string();
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CELL_SNAPSHOTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        self.truncate_changelog(&key, snapshot.seq)?;
        debug!(cell_id = %key, snapshot_id = snapshot.snapshot_id, seq = snapshot.seq, "snapshot stored");
        Ok(())
    }

    pub fn get_snapshot(&self, cell_id: &str) -> StateResult<Option<CellSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CELL_SNAPSHOTS).map_err(map_err!(Table))?;
        match table.get(cell_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let snapshot: CellSnapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Remove every trace of a cell (snapshot and changelog).
    pub fn remove_cell_data(&self, cell_id: &str) -> StateResult<()> {
        self.truncate_changelog(cell_id, u64::MAX)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CELL_SNAPSHOTS).map_err(map_err!(Table))?;
            table.remove(cell_id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%cell_id, "cell data removed");
        Ok(())
    }

    /// Rebuild a cell's tablets from its snapshot plus the changelog tail.
    ///
    /// Returns the last applied sequence number with the tablet map.
    pub fn recover_cell(&self, cell_id: &str) -> StateResult<(u64, BTreeMap<TabletId, TabletRows>)> {
        let (mut seq, mut tablets) = match self.get_snapshot(cell_id)? {
            Some(snapshot) => (snapshot.seq, snapshot.tablets),
            None => (0, BTreeMap::new()),
        };
        for record in self.read_changelog(cell_id, seq)? {
            record.apply(&mut tablets);
            seq = record.seq;
        }
        debug!(%cell_id, seq, tablets = tablets.len(), "cell state recovered");
        Ok((seq, tablets))
    }

    // ── Scheduler side snapshot ────────────────────────────────────

    pub fn put_fair_share_snapshot(&self, snapshot: &FairShareSnapshot) -> StateResult<()> {
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SCHEDULER_SNAPSHOTS).map_err(map_err!(Table))?;
            table
                .insert(snapshot.tree.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(tree = %snapshot.tree, pools = snapshot.pools.len(), "fair-share snapshot stored");
        Ok(())
    }

    pub fn get_fair_share_snapshot(&self, tree: &str) -> StateResult<Option<FairShareSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCHEDULER_SNAPSHOTS).map_err(map_err!(Table))?;
        match table.get(tree).map_err(map_err!(Read))? {
            Some(guard) => {
                let snapshot: FairShareSnapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use serde_json::json;
    use tessera_core::{CellId, OperationId, ResourceVector, TabletId};

    fn record(seq: u64, tablet: TabletId, key: &str, value: Option<serde_json::Value>) -> ChangelogRecord {
        let mutation = match value {
            Some(value) => Mutation::Write {
                key: key.to_string(),
                value,
            },
            None => Mutation::Delete { key: key.to_string() },
        };
        ChangelogRecord {
            seq,
            tablet_id: tablet,
            mutation,
            timestamp: 1000 + seq,
        }
    }

    #[test]
    fn changelog_reads_back_in_order_after_seq() {
        let store = StateStore::open_in_memory().unwrap();
        let cell = CellId::new().to_string();
        let tablet = TabletId::new();
        let records: Vec<_> = (1..=12)
            .map(|i| record(i, tablet, &format!("k{i}"), Some(json!(i))))
            .collect();
        store.append_changelog(&cell, &records).unwrap();

        let tail = store.read_changelog(&cell, 9).unwrap();
        assert_eq!(tail.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![10, 11, 12]);
        assert_eq!(store.last_changelog_seq(&cell).unwrap(), 12);
    }

    #[test]
    fn changelogs_of_different_cells_are_isolated() {
        let store = StateStore::open_in_memory().unwrap();
        let a = CellId::new().to_string();
        let b = CellId::new().to_string();
        let tablet = TabletId::new();
        store.append_changelog(&a, &[record(1, tablet, "x", Some(json!(1)))]).unwrap();
        store.append_changelog(&b, &[record(1, tablet, "y", None)]).unwrap();
        assert_eq!(store.read_changelog(&a, 0).unwrap().len(), 1);
        assert_eq!(
            store.read_changelog(&b, 0).unwrap()[0].mutation,
            Mutation::Delete { key: "y".to_string() }
        );
    }

    #[test]
    fn gap_in_changelog_is_reported() {
        let store = StateStore::open_in_memory().unwrap();
        let cell = CellId::new().to_string();
        let tablet = TabletId::new();
        store
            .append_changelog(&cell, &[record(1, tablet, "a", None), record(3, tablet, "b", None)])
            .unwrap();
        let err = store.read_changelog(&cell, 0).unwrap_err();
        assert!(matches!(err, StateError::ChangelogGap { expected: 2, got: 3, .. }));
    }

    #[test]
    fn snapshot_truncates_covered_changelog() {
        let store = StateStore::open_in_memory().unwrap();
        let cell_id = CellId::new();
        let cell = cell_id.to_string();
        let tablet = TabletId::new();
        let records: Vec<_> = (1..=5).map(|i| record(i, tablet, "k", Some(json!(i)))).collect();
        store.append_changelog(&cell, &records).unwrap();

        let mut rows = BTreeMap::new();
        rows.insert("k".to_string(), json!(3));
        let mut tablets = BTreeMap::new();
        tablets.insert(tablet, rows);
        store
            .put_snapshot(&CellSnapshot {
                cell_id,
                snapshot_id: 1,
                seq: 3,
                tablets,
            })
            .unwrap();

        let snapshot = store.get_snapshot(&cell).unwrap().unwrap();
        assert_eq!(snapshot.seq, 3);
        let tail = store.read_changelog(&cell, snapshot.seq).unwrap();
        assert_eq!(tail.len(), 2);

        store.remove_cell_data(&cell).unwrap();
        assert!(store.get_snapshot(&cell).unwrap().is_none());
        assert!(store.read_changelog(&cell, 0).unwrap().is_empty());
    }

    #[test]
    fn replay_rebuilds_tablet_rows() {
        let tablet = TabletId::new();
        let mut initial = BTreeMap::new();
        initial.insert("a".to_string(), json!(1));
        let records = vec![
            ChangelogRecord {
                seq: 1,
                tablet_id: tablet,
                mutation: Mutation::MountTablet { rows: initial },
                timestamp: 0,
            },
            record(2, tablet, "b", Some(json!(2))),
            record(3, tablet, "a", None),
        ];
        let mut tablets = BTreeMap::new();
        for r in &records {
            r.apply(&mut tablets);
        }
        let rows = &tablets[&tablet];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows["b"], json!(2));

        ChangelogRecord {
            seq: 4,
            tablet_id: tablet,
            mutation: Mutation::UnmountTablet,
            timestamp: 0,
        }
        .apply(&mut tablets);
        assert!(tablets.is_empty());
    }

    #[test]
    fn fair_share_snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        let op = OperationId::new();
        {
            let store = StateStore::open(&path).unwrap();
            let mut snapshot = FairShareSnapshot {
                tree: "default".to_string(),
                taken_at: 42,
                ..Default::default()
            };
            snapshot.pools.insert(
                "research".to_string(),
                PoolStateRecord {
                    historic_usage: ResourceVector::cpu(2.0),
                    integral_volume: ResourceVector::cpu(600.0),
                },
            );
            snapshot.operation_segments.insert(op, "large_gpu".to_string());
            store.put_fair_share_snapshot(&snapshot).unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        let snapshot = store.get_fair_share_snapshot("default").unwrap().unwrap();
        assert_eq!(snapshot.taken_at, 42);
        assert_eq!(snapshot.pools["research"].integral_volume.get("cpu"), 600.0);
        assert_eq!(snapshot.operation_segments[&op], "large_gpu");
        assert!(store.get_fair_share_snapshot("other").unwrap().is_none());
    }
}
