//! Balancer decisions, reported to the event log.

use serde::Serialize;
use tessera_core::{CellId, Millis};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BalancerEventKind {
    PeerAssigned { peer_id: usize, address: String },
    PeerRevoked { peer_id: usize, address: String, reason: String },
    MoveStarted { source: usize, extra: usize },
    LeaderMoved { source: usize, extra: usize },
    MoveCompleted { source: usize, dropped: Option<String> },
    MoveAborted { source: usize },
    CellDecommissioned,
    CellRemoved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalancerEvent {
    pub cell_id: CellId,
    pub at: Millis,
    #[serde(flatten)]
    pub kind: BalancerEventKind,
}

impl BalancerEvent {
    pub fn new(cell_id: CellId, at: Millis, kind: BalancerEventKind) -> Self {
        Self { cell_id, at, kind }
    }
}
