use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical timestamp handed out by the transaction engine.
pub type Timestamp = u64;

/// Identifier of an in-flight transaction. Always `>= TRANSACTION_INITIAL_ID`,
/// so it never collides with a start or commit timestamp.
pub type TransactionId = u64;

/// First transaction id. Timestamps live below this value.
pub const TRANSACTION_INITIAL_ID: TransactionId = 1 << 63;

/// Globally unique id of a vertex or an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gid(pub u64);

impl Gid {
    pub const MIN: Gid = Gid(0);
    pub const MAX: Gid = Gid(u64::MAX);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Labels, properties and edge types share one name/id mapper, so the three
// id kinds are thin wrappers around the mapper's u64.
macro_rules! name_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

name_id!(
    /// Id of a vertex label.
    LabelId
);
name_id!(
    /// Id of a property key.
    PropertyId
);
name_id!(
    /// Id of an edge type.
    EdgeTypeId
);

/// Id of a registered enum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnumTypeId(pub u64);

/// Position of a value inside its enum type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnumValueId(pub u64);
