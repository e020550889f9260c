//! tessera-state — embedded state store for Tessera.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the two kinds of state that
//! must survive a restart:
//!
//! - per-cell durable history: a changelog of row mutations keyed by
//!   `{cell_id}/{seq}` plus the latest compacted snapshot per cell;
//! - the scheduler's fair-share side snapshot, one record per pool tree.
//!
//! All values are JSON-serialized into `&[u8]` columns. `StateStore` is
//! `Clone + Send + Sync` (an `Arc<Database>` inside) and can be shared
//! across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{DbStage, StateError, StateResult};
pub use store::StateStore;
pub use types::*;
