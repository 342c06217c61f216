// Graph engine module

pub mod catalog;
pub mod constraints;
pub mod engine;
pub mod epoch;
pub mod indices;
pub mod schema;
pub mod storage;
pub mod transaction;
pub mod versioning;

pub use engine::GraphEngine;
pub use schema::SchemaInfo;
pub use storage::{GcStats, Storage};
pub use transaction::{IsolationLevel, Transaction};
