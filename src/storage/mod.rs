// Embedded key-value storage

pub mod rocks_backend;
pub use rocks_backend::{Pruned, RocksBackend, StoredEntry};
