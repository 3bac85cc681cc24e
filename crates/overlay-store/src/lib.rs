//! Job record storage.
//!
//! This crate provides:
//! - The `JobStore` key-value abstraction the scheduler writes through
//! - An in-process backend for single-node runs and tests
//! - A Redis backend storing each record as a JSON string

pub mod error;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryJobStore;
pub use redis_store::{RedisJobStore, RedisStoreConfig};
pub use store::{JobStore, RecordFilter};
