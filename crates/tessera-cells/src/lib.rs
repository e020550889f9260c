//! tessera-cells — bundles, tablet cells and the tables they serve.
//!
//! [`CellStore`] owns every bundle, cell, table and tablet action. Bundles
//! sit in an arena keyed by [`tessera_core::BundleId`]; cells point at
//! their bundle by id, and the cell list of a bundle is computed on demand.
//!
//! # Cell lifecycle
//!
//! ```text
//! running ── remove ──▶ decommissioning_on_node ──▶ decommissioned ──▶ removed
//!    │                                                                   ▲
//!    └──────────────────────────── force remove ─────────────────────────┘
//! ```
//!
//! Peer placement is decided by the balancer; the store records it,
//! validates node reports against the cell's config version and elects
//! leaders among following peers.
//!
//! # Data plane
//!
//! Rows of mounted tablets are written through the hosting cell's
//! changelog in [`tessera_state::StateStore`] and compacted into snapshots.
//! The leader's in-memory copy is a cache: leader changes and prerequisite
//! transaction aborts drop it, and the next access replays persisted state.

pub mod accounts;
pub mod actions;
pub mod bundle;
pub mod cell;
pub mod error;
pub mod rows;
pub mod store;
pub mod tables;
pub mod tablet;

pub use accounts::{Account, AccountLimits, AccountRegistry, AccountResources};
pub use actions::{NewTabletAction, TabletAction, TabletActionKind, TabletActionState};
pub use bundle::{Bundle, BundleBalancerConfig, BundleOptions, DynamicBundleOptions, RemovalState};
pub use cell::{Cell, CellHealth, LifeStage, Peer, PeerMove};
pub use error::{CellError, CellResult};
pub use store::CellStore;
pub use tablet::{Table, TableTabletState, Tablet, TabletCommand, TabletState};
