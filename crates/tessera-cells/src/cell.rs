//! Tablet cells and their peers.

use serde::{Deserialize, Serialize};
use tessera_core::{BundleId, CellId, Millis, PeerState, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellHealth {
    Good,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifeStage {
    #[default]
    Running,
    DecommissioningOnNode,
    Decommissioned,
    Removed,
}

/// One member of the cell's consensus group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub address: Option<String>,
    pub state: PeerState,
    /// Config version the node last reported for this peer.
    pub config_version: u64,
    pub assigned_at: Option<Millis>,
    /// When the hosting node was first seen unusable for this peer.
    pub lost_since: Option<Millis>,
}

impl Peer {
    pub fn is_assigned(&self) -> bool {
        self.address.is_some()
    }
}

/// Moving a peer off a node by temporarily adding an extra peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMove {
    /// Peer being replaced.
    pub source: usize,
    /// Index of the temporary extra peer.
    pub extra: usize,
    pub started_at: Millis,
    /// Set once leadership moved to the extra peer.
    pub leader_moved_at: Option<Millis>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub bundle_id: BundleId,
    /// Overrides the bundle's peer count when set.
    pub peer_count_override: Option<usize>,
    pub peers: Vec<Peer>,
    pub config_version: u64,
    pub life_stage: LifeStage,
    pub prerequisite_transaction_id: TransactionId,
    pub max_changelog_id: u64,
    pub max_snapshot_id: u64,
    pub moves: Vec<PeerMove>,
    pub created_at: Millis,
}

impl Cell {
    pub fn new(bundle_id: BundleId, peer_count: usize, now: Millis) -> Self {
        Self {
            id: CellId::new(),
            bundle_id,
            peer_count_override: None,
            peers: vec![Peer::default(); peer_count],
            config_version: 1,
            life_stage: LifeStage::Running,
            prerequisite_transaction_id: TransactionId::new(),
            max_changelog_id: 0,
            max_snapshot_id: 0,
            moves: Vec::new(),
            created_at: now,
        }
    }

    /// The serving leader. A reconfiguration does not depose it; it only
    /// makes the cell unhealthy until the leader re-reports.
    pub fn leading_peer(&self) -> Option<usize> {
        self.peers
            .iter()
            .position(|p| p.is_assigned() && p.state == PeerState::Leading)
    }

    /// Good iff every peer is leading or following at the current config
    /// version and exactly one peer leads.
    pub fn health(&self) -> CellHealth {
        let leaders = self
            .peers
            .iter()
            .filter(|p| p.state == PeerState::Leading && p.config_version == self.config_version)
            .count();
        let all_active = self.peers.iter().all(|p| {
            p.address.is_some() && p.state.is_active() && p.config_version == self.config_version
        });
        match leaders {
            1 if all_active => CellHealth::Good,
            1 => CellHealth::Degraded,
            _ => CellHealth::Failed,
        }
    }

    pub fn is_extra_peer(&self, peer_id: usize) -> bool {
        self.moves.iter().any(|m| m.extra == peer_id)
    }

    pub fn is_moving(&self, peer_id: usize) -> bool {
        self.moves.iter().any(|m| m.source == peer_id)
    }

    /// Bump the config version. Every peer must re-report against it.
    pub fn bump_version(&mut self) -> u64 {
        self.config_version += 1;
        self.config_version
    }

    pub fn peer_addresses(&self) -> impl Iterator<Item = (usize, &str)> {
        self.peers
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.address.as_deref().map(|a| (i, a)))
    }
}
