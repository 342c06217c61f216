use thiserror::Error;

use crate::durability::marker::Marker;
use crate::types::{Gid, LabelId, PropertyId};

/// Which kind of constraint a violation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Existence,
    Unique,
    Type,
}

/// A registered constraint rejected the state a transaction tried to produce.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} constraint violated on label {label} for properties {properties:?}")]
pub struct ConstraintViolation {
    pub kind: ConstraintKind,
    pub label: LabelId,
    pub properties: Vec<PropertyId>,
}

/// Why a data-manipulating operation (a write or a commit) failed.
///
/// Callers decide retry vs. surfacing the failure by matching on the
/// variant: `Serialization` is retried as a whole transaction, the others
/// are reported.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageManipulationError {
    #[error(transparent)]
    ConstraintViolation(#[from] ConstraintViolation),

    #[error("At least one SYNC replica has not confirmed committing the last transaction")]
    SyncReplication,

    #[error("At least one STRICT_SYNC replica has not confirmed committing the last transaction")]
    StrictSyncReplication,

    #[error("Cannot resolve conflicting transactions. Retry this transaction when the conflicting transaction is finished")]
    Serialization,

    #[error("Failed to persist the transaction")]
    Persistence,
}

/// Why an index definition (create/drop) was rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexDefinitionError {
    #[error("Index definition error: the index does not exist or could not be built")]
    Definition,

    #[error("Index already exists")]
    AlreadyExists,

    #[error("Index configuration error: invalid property list")]
    Config,

    #[error("Index creation was cancelled")]
    Cancelled,
}

/// Why a constraint definition (create/drop) was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintDefinitionError {
    #[error(transparent)]
    Violation(#[from] ConstraintViolation),

    #[error("Constraint definition error: the constraint already exists or is missing")]
    Definition,
}

/// Malformed or unreadable snapshot content. Carries enough context
/// (offsets, expected vs. found) to diagnose corruption.
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("I/O error at offset {offset}: {source}")]
    Io {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid snapshot magic: expected {expected:?}, found {found:?}")]
    InvalidMagic { expected: Vec<u8>, found: Vec<u8> },

    #[error("Unsupported snapshot version {found} (supported {oldest}..={current})")]
    UnsupportedVersion { found: u64, oldest: u64, current: u64 },

    #[error("Snapshot is truncated at offset {offset}")]
    Truncated { offset: u64 },

    #[error("Unexpected marker at offset {offset}: expected {expected:?}, found {found:#04x}")]
    UnexpectedMarker {
        offset: u64,
        expected: Marker,
        found: u8,
    },

    #[error("Snapshot section offsets are not strictly increasing: {0:?}")]
    NonMonotonicOffsets(Vec<u64>),

    #[error("Section {section} ends at offset {found}, expected {expected}")]
    SectionSizeMismatch {
        section: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("Dangling reference: {0}")]
    DanglingReference(String),

    #[error("Duplicate {kind} gid {gid}")]
    DuplicateGid { kind: &'static str, gid: Gid },

    #[error("Invalid data at offset {offset}: {reason}")]
    InvalidData { offset: u64, reason: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage error: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Encoding(#[from] Box<bincode::ErrorKind>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vertex not found: {0}")]
    VertexNotFound(Gid),

    #[error("Edge not found: {0}")]
    EdgeNotFound(Gid),

    #[error("Object {0} was deleted")]
    DeletedObject(Gid),

    #[error("Vertex {0} still has edges")]
    VertexHasEdges(Gid),

    #[error("Properties on edges are disabled")]
    PropertiesDisabled,

    #[error(transparent)]
    Manipulation(#[from] StorageManipulationError),

    #[error(transparent)]
    IndexDefinition(#[from] IndexDefinitionError),

    #[error(transparent)]
    ConstraintDefinition(#[from] ConstraintDefinitionError),

    #[error("Recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Lock failed: {0}")]
    LockPoisoned(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Catalog error: {0}")]
    Catalog(String),
}

impl StorageError {
    /// The manipulation failure kind, if this error is one.
    pub fn manipulation_kind(&self) -> Option<&StorageManipulationError> {
        match self {
            StorageError::Manipulation(kind) => Some(kind),
            _ => None,
        }
    }

    pub(crate) fn lock<E: std::fmt::Display>(e: E) -> Self {
        StorageError::LockPoisoned(e.to_string())
    }
}

impl From<ConstraintViolation> for StorageError {
    fn from(violation: ConstraintViolation) -> Self {
        StorageError::Manipulation(StorageManipulationError::ConstraintViolation(violation))
    }
}

// This creates a handy shortcut for our functions.
// Instead of writing Result<String, StorageError>, we can just write Result<String>.
pub type Result<T> = std::result::Result<T, StorageError>;
