//! Snapshot durability: the binary encoding, the format constants and the
//! snapshot writer/reader built on them.

pub mod marker;
pub mod serialization;
pub mod snapshot;
pub mod version;

pub use snapshot::{
    create_snapshot, load_snapshot, overwrite_snapshot_uuid, read_snapshot_info, RecoveredSnapshot, SnapshotInfo,
};
