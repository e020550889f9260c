//! tessera-core — shared vocabulary for the tablet-cell control plane and
//! the fair-share scheduler.
//!
//! Everything here is plain data plus total functions. The heavier crates
//! (`tessera-cells`, `tessera-fairshare`, `tessera-scheduler`, ...) build on
//! these types and never re-define them.
//!
//! # Contents
//!
//! - [`ResourceVector`]: named resource bag with saturating arithmetic and
//!   dominant-resource helpers.
//! - [`TagFilter`]: boolean expression over node tags.
//! - [`Acl`]: access control entries checked against users and groups.
//! - [`TesseraConfig`]: dynamic configuration loaded from TOML.
//! - [`ErrorKind`] / [`Alert`]: error classification and persistent alerts.

pub mod acl;
pub mod alerts;
pub mod config;
pub mod error;
pub mod ids;
pub mod peer;
pub mod resources;
pub mod tags;
pub mod time;

pub use acl::{Acl, Ace, AceAction, Permission, UserDirectory, EVERYONE_GROUP, ROOT_USER};
pub use alerts::{Alert, AlertKind, AlertSet};
pub use config::*;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use ids::*;
pub use peer::PeerState;
pub use resources::{approx_eq, approx_le, ResourceVector, EPSILON, MAIN_RESOURCE};
pub use tags::{validate_tag, TagFilter};
pub use time::{now_ms, Millis};
