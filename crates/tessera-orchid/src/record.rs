//! Event log records.
//!
//! Every record is a flat JSON object with an `event_type` and a
//! `timestamp` (milliseconds); the remaining fields depend on the type and
//! consumers ignore the ones they do not know. Optional fields are omitted
//! rather than written as `null`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use tessera_balancer::BalancerEvent;
use tessera_core::{Millis, ResourceVector};
use tessera_fairshare::TreeShares;
use tessera_pools::PoolTree;
use tessera_scheduler::SchedulerEvent;

use crate::error::{OrchidError, OrchidResult};

pub const POOLS_INFO: &str = "pools_info";
pub const FAIR_SHARE_INFO: &str = "fair_share_info";
pub const ACCUMULATED_USAGE_INFO: &str = "accumulated_usage_info";
pub const METERING: &str = "metering";

/// Prefix of records produced from cell balancer events.
const CELL_PREFIX: &str = "cell_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_type: String,
    pub timestamp: Millis,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EventRecord {
    pub fn new(event_type: &str, timestamp: Millis) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp,
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        if !value.is_null() {
            self.fields.insert(key.to_string(), value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_json_line(&self) -> OrchidResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_scheduler(event: &SchedulerEvent) -> OrchidResult<Self> {
        Self::from_tagged(serde_json::to_value(event)?, "")
    }

    /// Balancer records are prefixed with `cell_` (`cell_peer_assigned`).
    pub fn from_balancer(event: &BalancerEvent) -> OrchidResult<Self> {
        Self::from_tagged(serde_json::to_value(event)?, CELL_PREFIX)
    }

    /// Lift an internally tagged event (`type` + `at`) into a record.
    fn from_tagged(value: Value, prefix: &str) -> OrchidResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(OrchidError::Malformed("event is not an object".into()));
        };
        let event_type = match fields.remove("type") {
            Some(Value::String(t)) => format!("{prefix}{t}"),
            _ => return Err(OrchidError::Malformed("event has no type tag".into())),
        };
        let timestamp = fields.remove("at").and_then(|v| v.as_u64()).unwrap_or_default();
        fields.retain(|_, v| !v.is_null());
        Ok(Self {
            event_type,
            timestamp,
            fields,
        })
    }
}

// ── Fair-share records ─────────────────────────────────────────────

/// Static pool structure of one tree.
pub fn pools_info(shares: &TreeShares, now: Millis) -> EventRecord {
    let pools: Map<String, Value> = shares
        .pools
        .values()
        .map(|p| {
            (
                p.name.clone(),
                json!({
                    "parent": p.parent,
                    "mode": p.mode,
                    "weight": p.weight,
                    "is_ephemeral": p.is_ephemeral,
                    "strong_guarantee_share": p.strong_guarantee_share,
                    "resource_limits": p.resource_limits,
                }),
            )
        })
        .collect();
    EventRecord::new(POOLS_INFO, now)
        .with("tree_id", json!(shares.tree))
        .with("pools", Value::Object(pools))
}

/// One `fair_share_info` base record followed by pool and operation
/// batches of at most `batch_size` entries. All records carry the tree
/// and `tree_snapshot_id` so a consumer can join them back together.
pub fn fair_share_info(shares: &TreeShares, now: Millis, batch_size: usize) -> OrchidResult<Vec<EventRecord>> {
    let batch_size = batch_size.max(1);
    let header = || {
        EventRecord::new(FAIR_SHARE_INFO, now)
            .with("tree_id", json!(shares.tree))
            .with("tree_snapshot_id", json!(shares.snapshot_id))
    };

    let mut records = vec![header()
        .with("pool_count", json!(shares.pools.len()))
        .with(
            "resource_distribution_info",
            json!({
                "total_resources": shares.total_resources,
                "operation_count": shares.operations.len(),
                "unresolved_operations": shares.unresolved_operations,
            }),
        )];

    let pools: Vec<(String, Value)> = shares
        .pools
        .iter()
        .map(|(name, share)| Ok((name.clone(), serde_json::to_value(share)?)))
        .collect::<OrchidResult<_>>()?;
    for (index, batch) in pools.chunks(batch_size).enumerate() {
        records.push(
            header()
                .with("pools_batch_index", json!(index))
                .with("pools", Value::Object(batch.iter().cloned().collect())),
        );
    }

    let operations: Vec<(String, Value)> = shares
        .operations
        .iter()
        .map(|(id, share)| Ok((id.to_string(), serde_json::to_value(share)?)))
        .collect::<OrchidResult<_>>()?;
    for (index, batch) in operations.chunks(batch_size).enumerate() {
        records.push(
            header()
                .with("operations_batch_index", json!(index))
                .with("operations", Value::Object(batch.iter().cloned().collect())),
        );
    }
    Ok(records)
}

/// Usage accumulated per pool since the previous record, in
/// resource·seconds.
pub fn accumulated_usage_info(tree: &str, usage: &BTreeMap<String, ResourceVector>, now: Millis) -> EventRecord {
    let pools: Map<String, Value> = usage
        .iter()
        .map(|(pool, volume)| (pool.clone(), json!({ "accumulated_resource_usage": volume })))
        .collect();
    EventRecord::new(ACCUMULATED_USAGE_INFO, now)
        .with("tree_id", json!(tree))
        .with("pools", Value::Object(pools))
}

/// One metering record per explicit pool that consumed anything between
/// `since` and `now`. Allocation is the average over the window.
pub fn metering(tree: &PoolTree, usage: &BTreeMap<String, ResourceVector>, since: Millis, now: Millis) -> Vec<EventRecord> {
    let window_ms = now.saturating_sub(since);
    if window_ms == 0 {
        return Vec::new();
    }
    let window_secs = window_ms as f64 / 1000.0;
    usage
        .iter()
        .filter_map(|(name, volume)| {
            let pool = tree.pool(name)?;
            if pool.is_root() || pool.is_ephemeral {
                return None;
            }
            let strong = pool
                .config
                .strong_guarantee_resources
                .clone()
                .unwrap_or_default();
            Some(
                EventRecord::new(METERING, now)
                    .with("id", json!(format!("{}:{}:{}", tree.name(), name, now / 1000)))
                    .with(
                        "usage",
                        json!({
                            "quantity": window_ms,
                            "unit": "milliseconds",
                            "start": since / 1000,
                            "finish": now / 1000,
                        }),
                    )
                    .with(
                        "tags",
                        json!({
                            "strong_guarantee_resources": strong,
                            "allocated_resources": volume.scale(1.0 / window_secs),
                            "pool_tree": tree.name(),
                            "pool": name,
                        }),
                    ),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_balancer::BalancerEventKind;
    use tessera_core::{CellId, JobId, OperationId};
    use tessera_scheduler::{AbortReason, SchedulerEventKind};

    #[test]
    fn scheduler_event_is_flattened() {
        let op = OperationId::new();
        let event = SchedulerEvent::new(
            42,
            SchedulerEventKind::JobAborted {
                job_id: JobId::new(),
                operation_id: op,
                node: "n1".into(),
                reason: AbortReason::Preemption,
                preempted_for: None,
            },
        );
        let record = EventRecord::from_scheduler(&event).unwrap();
        assert_eq!(record.event_type, "job_aborted");
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.get("operation_id"), Some(&json!(op.to_string())));
        assert_eq!(record.get("reason"), Some(&json!("preemption")));
        assert!(record.get("preempted_for").is_none());
        assert!(record.get("type").is_none());

        let line = record.to_json_line().unwrap();
        assert!(line.contains("\"event_type\":\"job_aborted\""));
    }

    #[test]
    fn balancer_events_get_cell_prefix() {
        let cell = CellId::new();
        let event = BalancerEvent::new(
            cell,
            7,
            BalancerEventKind::PeerRevoked {
                peer_id: 1,
                address: "n2".into(),
                reason: "node lost".into(),
            },
        );
        let record = EventRecord::from_balancer(&event).unwrap();
        assert_eq!(record.event_type, "cell_peer_revoked");
        assert_eq!(record.get("cell_id"), Some(&json!(cell.to_string())));
        assert_eq!(record.get("peer_id"), Some(&json!(1)));
    }

    #[test]
    fn record_round_trips_through_json() {
        let record = EventRecord::new("operation_completed", 5).with("operation_id", json!("x"));
        let parsed: EventRecord = serde_json::from_str(&record.to_json_line().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }
}
