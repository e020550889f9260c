//! tessera-pools — pool trees for the fair-share scheduler.
//!
//! A [`PoolTree`] is a hierarchy of [`Pool`]s under a root named
//! `<Root>`. Pools carry weights, strong and integral guarantees, resource
//! limits, operation count limits and ACLs. The tree also records which
//! pool every operation is placed in, so renames and moves keep
//! operations, historic usage and integral volume together.
//!
//! # Ephemeral pools
//!
//! ```text
//!   submit into unknown pool ──▶ ephemeral (under default parent)
//!          │                              │
//!          │ create_pool(same name)       │ last operation leaves
//!          ▼                              ▼
//!       explicit ◀── (state kept)      removed
//!          │
//!          │ remove_pool while operations remain
//!          ▼
//!       ephemeral (state cleared)
//! ```
//!
//! Pools with `create_ephemeral_subpools` put each user's operations into
//! an internal `pool$user` subpool built from `ephemeral_subpool_config`.

pub mod error;
pub mod pool;
pub mod tree;
pub mod trees;

pub use error::{PoolError, PoolResult};
pub use pool::{
    ephemeral_subpool_name, validate_pool_name, EphemeralSubpoolConfig, HistoricUsageAggregationMode,
    HistoricUsageConfig, IntegralGuaranteeType, IntegralGuarantees, Pool, PoolConfig, PoolKind,
    SchedulingMode,
};
pub use tree::{PoolOperation, PoolTree};
pub use trees::PoolTrees;
