//! tessera-fairshare — hierarchical fair share over a pool tree.
//!
//! # Architecture
//!
//! ```text
//!   PoolTree ─┐
//!             ├──▶ FairShareEngine::update ──▶ TreeShares ──▶ scheduler
//!   UpdateInput ┘        │                         (dispatch, preemption,
//!   (operations,         └── writes pool state      orchid, event log)
//!    node free)              (historic usage, integral volume)
//! ```
//!
//! Each update works top-down from the root's share of 1:
//!
//! 1. strong guarantees are resolved bottom-up and scaled down wherever
//!    children claim more than their parent holds;
//! 2. burst pools turn accumulated volume into share up to their burst
//!    guarantee, relaxed pools split what is left by volume;
//! 3. the rest is water-filled by weight among siblings, operations of a
//!    fifo pool are served in submission order.
//!
//! Starvation is tracked per pool and operation with timeouts and
//! tolerances inherited down the tree.

pub mod distribute;
pub mod engine;
pub mod integral;
pub mod shares;
pub mod starvation;

pub use distribute::{capped_fill, fifo_fill, weighted_fill, Claim};
pub use engine::{cap_to_limits, FairShareEngine, OperationInput, UpdateInput};
pub use integral::{accrue_volumes, IntegralSettings};
pub use shares::{DetailedFairShare, IntegralInfo, OperationShare, PoolShare, StarvationStatus, TreeShares};
pub use starvation::{EntityKey, StarvationParams, StarvationTracker};
