//! Orchid: a read-only JSON view of live state.
//!
//! ```text
//!   /scheduler/config
//!   /scheduler/pool_trees/<tree>/pools/<pool>
//!   /scheduler/pool_trees/<tree>/operations/<op>
//!   /scheduler/operations/<op>
//!   /scheduler/jobs/<job>
//!   /scheduler/alerts
//!   /scheduler/nodes/<address>
//!   /tablet_cells/<cell id>
//!   /tablet_cell_bundles/<bundle>
//! ```
//!
//! The tree is rebuilt from the owners' state and then served as is, so a
//! reader sees the state as of the last rebuild.

use serde_json::{json, Map, Value};

use tessera_cells::CellStore;
use tessera_core::Millis;
use tessera_nodes::NodeRegistry;
use tessera_pools::PoolTree;
use tessera_scheduler::{Operation, Scheduler};

use crate::error::{OrchidError, OrchidResult};

#[derive(Debug, Clone, Default)]
pub struct OrchidTree {
    root: Value,
    built_at: Millis,
}

impl OrchidTree {
    pub fn build(scheduler: &Scheduler, nodes: &NodeRegistry, cells: &CellStore, now: Millis) -> OrchidResult<Self> {
        let root = json!({
            "scheduler": scheduler_orchid(scheduler, nodes)?,
            "tablet_cells": cells
                .cell_ids()
                .into_iter()
                .filter_map(|id| Some((id.to_string(), cells.cell_orchid(id)?)))
                .collect::<Map<_, _>>(),
            "tablet_cell_bundles": cells
                .bundles()
                .filter_map(|b| Some((b.name.clone(), cells.bundle_orchid(&b.name)?)))
                .collect::<Map<_, _>>(),
        });
        Ok(Self { root, built_at: now })
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn built_at(&self) -> Millis {
        self.built_at
    }

    /// Look up a slash-separated path. `/` and `""` resolve to the root;
    /// numeric segments index into lists.
    pub fn resolve(&self, path: &str) -> OrchidResult<&Value> {
        let mut node = &self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = match node {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| OrchidError::Resolve(path.to_string()))?;
        }
        Ok(node)
    }

    /// Child names of a map node, or indices of a list node.
    pub fn list(&self, path: &str) -> OrchidResult<Vec<String>> {
        match self.resolve(path)? {
            Value::Object(map) => Ok(map.keys().cloned().collect()),
            Value::Array(items) => Ok((0..items.len()).map(|i| i.to_string()).collect()),
            _ => Err(OrchidError::Resolve(path.to_string())),
        }
    }
}

fn scheduler_orchid(scheduler: &Scheduler, nodes: &NodeRegistry) -> OrchidResult<Value> {
    let mut pool_trees = Map::new();
    for tree in scheduler.trees().iter() {
        pool_trees.insert(tree.name().to_string(), tree_orchid(scheduler, tree)?);
    }
    let operations: Map<String, Value> = scheduler
        .operations()
        .map(|op| (op.id.to_string(), operation_orchid(op)))
        .collect();
    let mut jobs = Map::new();
    for job in scheduler.jobs() {
        jobs.insert(job.id.to_string(), serde_json::to_value(job)?);
    }
    Ok(json!({
        "config": serde_json::to_value(scheduler.config())?,
        "pool_trees": pool_trees,
        "operations": operations,
        "jobs": jobs,
        "alerts": serde_json::to_value(scheduler.alerts().list())?,
        "nodes": nodes.orchid(),
    }))
}

fn tree_orchid(scheduler: &Scheduler, tree: &PoolTree) -> OrchidResult<Value> {
    let shares = scheduler.shares(tree.name());

    let mut pools = Map::new();
    for pool in tree.pools() {
        let mut entry = serde_json::to_value(pool)?;
        if let (Value::Object(entry), Some(share)) = (&mut entry, shares.and_then(|s| s.pool(&pool.name)))
            && let Value::Object(share) = serde_json::to_value(share)?
        {
            entry.extend(share);
        }
        pools.insert(pool.name.clone(), entry);
    }

    let mut operations = Map::new();
    for (id, placement) in tree.operations() {
        let mut entry = serde_json::to_value(placement)?;
        if let (Value::Object(entry), Some(share)) = (&mut entry, shares.and_then(|s| s.operation(id)))
            && let Value::Object(share) = serde_json::to_value(share)?
        {
            entry.extend(share);
        }
        operations.insert(id.to_string(), entry);
    }

    Ok(json!({
        "config": serde_json::to_value(tree.config())?,
        "snapshot_id": shares.map(|s| s.snapshot_id),
        "updated_at": shares.map(|s| s.taken_at),
        "total_resources": shares.map(|s| &s.total_resources),
        "pools": pools,
        "operations": operations,
    }))
}

fn operation_orchid(op: &Operation) -> Value {
    json!({
        "id": op.id,
        "user": op.user,
        "kind": op.kind,
        "state": op.state,
        "suspended": op.suspended,
        "pools": op.pools,
        "spec": op.raw_spec,
        "submitted_at": op.submitted_at,
        "started_at": op.started_at,
        "finished_at": op.finished_at,
        "pending_job_count": op.pending_job_count,
        "running_job_count": op.running_jobs.len(),
        "completed_job_count": op.completed_job_count,
        "failed_job_count": op.failed_job_count,
        "aborted_job_count": op.aborted_job_count,
        "scheduling_segment": op.spec.segment(),
        "error": op.error,
    })
}
