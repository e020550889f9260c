//! tessera-orchid — event log records and the orchid state view.
//!
//! # Architecture
//!
//! ```text
//!   SchedulerEvent ─┐
//!   BalancerEvent ──┼──▶ EventRecord ──▶ EventLogWriter ──▶ EventSink
//!   TreeShares ─────┘    (flat JSON)     (buffer, flush,    (memory ring,
//!                                         retry backoff)     JSON lines file)
//!
//!   Scheduler + NodeRegistry + CellStore ──▶ OrchidTree::build ──▶ resolve(path)
//! ```
//!
//! Records are append-only and self-describing: `event_type`, `timestamp`
//! and type-specific fields. The orchid tree is a point-in-time JSON view
//! that API handlers resolve paths against.

pub mod error;
pub mod record;
pub mod sink;
pub mod tree;
pub mod writer;

pub use error::{OrchidError, OrchidResult};
pub use record::{accumulated_usage_info, fair_share_info, metering, pools_info, EventRecord};
pub use sink::{EventSink, FileEventSink, MemoryEventSink};
pub use tree::OrchidTree;
pub use writer::EventLogWriter;
