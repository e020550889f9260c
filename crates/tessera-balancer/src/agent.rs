//! In-process stand-in for the node side of cell peers.
//!
//! Real nodes report each hosted peer's state with their heartbeats. The
//! agent does the same from the registry's point of view: every peer on an
//! available node reports `following` at the cell's current config version
//! (a leader keeps leading), peers of decommissioning cells report
//! `stopped`, and cells without a leader elect one.

use tracing::debug;

use tessera_cells::{CellResult, CellStore, LifeStage};
use tessera_core::PeerState;
use tessera_nodes::NodeRegistry;

/// Report peer states for every cell and elect missing leaders.
/// Returns the number of accepted reports.
pub fn settle_peers(store: &mut CellStore, registry: &NodeRegistry) -> CellResult<usize> {
    let mut accepted = 0;
    for cell_id in store.cell_ids() {
        let Some(cell) = store.cell(cell_id) else {
            continue;
        };
        let stopping = matches!(
            cell.life_stage,
            LifeStage::DecommissioningOnNode | LifeStage::Decommissioned
        );
        let version = cell.config_version;
        let reports: Vec<(usize, String, PeerState)> = cell
            .peer_addresses()
            .filter(|(_, address)| registry.get(address).is_some_and(|n| n.is_available()))
            .filter_map(|(peer_id, address)| {
                let peer = &cell.peers[peer_id];
                let state = if stopping {
                    PeerState::Stopped
                } else if peer.state == PeerState::Leading {
                    PeerState::Leading
                } else {
                    PeerState::Following
                };
                let stale = peer.state != state || peer.config_version != version;
                stale.then(|| (peer_id, address.to_string(), state))
            })
            .collect();

        for (peer_id, address, state) in reports {
            if store.report_peer_state(cell_id, peer_id, &address, state, version)? {
                accepted += 1;
            }
        }
        if !stopping {
            store.elect_leader(cell_id)?;
        }
    }
    if accepted > 0 {
        debug!(accepted, "peer reports applied");
    }
    Ok(accepted)
}
