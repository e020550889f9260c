//! Identifier newtypes.
//!
//! Cells, operations, jobs, transactions and tablet actions are identified by
//! random UUIDs. Bundles are arena-indexed by a small integer so cells can
//! refer to them without owning them.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Tablet cell id.
    CellId
);
uuid_id!(
    /// Scheduler operation id.
    OperationId
);
uuid_id!(
    /// Job id, unique across operations.
    JobId
);
uuid_id!(
    /// Master-side transaction id (cell prerequisite transactions).
    TransactionId
);
uuid_id!(
    /// Tablet action id.
    TabletActionId
);
uuid_id!(TabletId);

/// Arena index of a tablet cell bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(pub u32);

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bundle-{}", self.0)
    }
}
