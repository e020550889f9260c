//! tessera-balancer — keeps every tablet cell's peers placed on eligible
//! nodes.
//!
//! # Architecture
//!
//! ```text
//!   NodeRegistry ──▶ CellBalancer::tick ──▶ CellStore (assign / revoke / move)
//!        ▲                  │
//!        └── sync_slots ◀───┘            settle_peers (node-side reports)
//! ```
//!
//! The cell store owns peer placement. The balancer judges each peer
//! against the registry, places missing peers with [`rank_nodes`], drains
//! leaving nodes (optionally through an extra peer so the cell never loses
//! its leader), evens out load, and finally rewrites the registry's slot
//! tables from the store.
//!
//! [`settle_peers`] plays the node side: it reports peer states at the
//! current config version and elects leaders, so a standalone daemon and
//! the tests can drive cells to `good` health without real nodes.

pub mod agent;
pub mod balancer;
pub mod decommissioner;
pub mod events;
pub mod placement;

pub use agent::settle_peers;
pub use balancer::{sync_slots, CellBalancer};
pub use decommissioner::Decommissioner;
pub use events::{BalancerEvent, BalancerEventKind};
pub use placement::{rank_nodes, SlotLoad};
