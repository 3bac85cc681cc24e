//! The store abstraction.

use async_trait::async_trait;

use overlay_models::{JobId, JobRecord};

use crate::error::StoreResult;

/// Predicate used by [`JobStore::scan`].
pub type RecordFilter<'a> = &'a (dyn Fn(&JobRecord) -> bool + Send + Sync);

/// Key-value mapping from job id to job record.
///
/// Backends hold no business rules; callers are responsible for serializing
/// writes to the same record.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or replace the record stored under `id`.
    async fn put(&self, id: &JobId, record: &JobRecord) -> StoreResult<()>;

    /// Fetch a record, failing with `StoreError::NotFound` if absent.
    async fn get(&self, id: &JobId) -> StoreResult<JobRecord>;

    /// Remove a record. Returns whether anything was deleted.
    async fn delete(&self, id: &JobId) -> StoreResult<bool>;

    /// All records matching `filter`, in no particular order.
    async fn scan(&self, filter: RecordFilter<'_>) -> StoreResult<Vec<JobRecord>>;
}
