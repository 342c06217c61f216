//! A multi-version labelled property graph storage core: snapshot-isolated
//! transactions, label-property indices kept in memory or in RocksDB, and
//! snapshot durability.

pub mod config;
pub mod durability;
pub mod error;
pub mod graph;
pub mod logging;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::{Config, StorageMode};
pub use error::{
    ConstraintDefinitionError, IndexDefinitionError, RecoveryError, Result, StorageError, StorageManipulationError,
};
pub use graph::indices::{LabelPropertyIndex, LabelPropertyKey, ValueFilter};
pub use graph::{GraphEngine, Storage, Transaction};
pub use types::{EdgeTypeId, Gid, LabelId, PropertyId, PropertyValue, Timestamp};
