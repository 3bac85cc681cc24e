//! In-process job store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use overlay_models::{JobId, JobRecord};

use crate::error::{StoreError, StoreResult};
use crate::store::{JobStore, RecordFilter};

/// Job store backed by a `HashMap`. Records live as long as the process.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn put(&self, id: &JobId, record: &JobRecord) -> StoreResult<()> {
        self.records
            .write()
            .await
            .insert(id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> StoreResult<JobRecord> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn delete(&self, id: &JobId) -> StoreResult<bool> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn scan(&self, filter: RecordFilter<'_>) -> StoreResult<Vec<JobRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|record| filter(record))
            .cloned()
            .collect())
    }
}
