//! Cell peer vocabulary shared by the node registry and the cell store.

use serde::{Deserialize, Serialize};

/// State of one cell peer as reported by its node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    #[default]
    None,
    Following,
    Leading,
    Stopped,
}

impl PeerState {
    /// Leading or following.
    pub fn is_active(self) -> bool {
        matches!(self, PeerState::Following | PeerState::Leading)
    }
}
