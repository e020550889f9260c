//! tessera-nodes — the node registry.
//!
//! Tracks every cluster node: liveness, administrative flags, user tags,
//! resource limits and usage, and the tablet slots assigned to cell peers.
//! Both the cell balancer and the operation scheduler read from here.
//!
//! Operations on unknown addresses are ignored so teardown paths can be
//! replayed safely.

pub mod node;
pub mod registry;

pub use node::{Node, NodeFlag, NodeFlags, NodeState, TabletSlot, DEFAULT_SEGMENT, SEGMENT_TAG_PREFIX};
pub use registry::NodeRegistry;
