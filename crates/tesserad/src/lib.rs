//! tesserad — tablet-cell control plane and fair-share scheduler in one
//! process.
//!
//! # Architecture
//!
//! ```text
//!   nodes ──heartbeat──► ┌──────────────────────────────────────┐
//!   admin ──HTTP───────► │ api (axum)                           │
//!                        │   │                                  │
//!                        │   ▼                                  │
//!                        │ Controller                           │
//!                        │   ├─ SchedulerService (pools, ops)   │
//!                        │   ├─ NodeRegistry                    │
//!                        │   ├─ CellStore (bundles, tables)     │
//!                        │   ├─ CellBalancer                    │
//!                        │   ├─ EventLogWriter ──► sink         │
//!                        │   └─ OrchidTree ◄── GET /orchid/...  │
//!                        └───────────▲──────────────────────────┘
//!                                    │
//!                 loops: fair-share │ balancer │ event-log flush
//! ```
//!
//! The loops rebuild the orchid after every pass, so orchid reads lag
//! mutations by at most one pass.

pub mod api;
pub mod controller;
pub mod handlers;
pub mod loops;

pub use api::{build_router, ApiError, ApiResponse};
pub use controller::Controller;
pub use loops::spawn_loops;
