//! Job records in Redis.
//!
//! Each record is a JSON string under `{prefix}:{job_id}`. Terminal records
//! optionally carry a TTL so Redis can expire them even if no sweeper runs.

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use overlay_models::{JobId, JobRecord};

use crate::error::{StoreError, StoreResult};
use crate::store::{JobStore, RecordFilter};

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 100;

/// Redis store configuration.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis URL
    pub redis_url: String,
    /// Key namespace for job records
    pub key_prefix: String,
    /// Expiry applied to terminal records
    pub terminal_ttl: Option<Duration>,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "overlay:job".to_string(),
            terminal_ttl: None,
        }
    }
}

impl RedisStoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("OVERLAY_STORE_PREFIX")
                .unwrap_or_else(|_| "overlay:job".to_string()),
            terminal_ttl: std::env::var("OVERLAY_STORE_TERMINAL_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    /// Raise the terminal TTL to at least `min`.
    ///
    /// A record must outlive the retention sweep that removes its files, or
    /// Redis drops it first and the output is never cleaned up.
    pub fn with_min_terminal_ttl(mut self, min: Duration) -> Self {
        if let Some(ttl) = self.terminal_ttl {
            if ttl < min {
                warn!(
                    ttl_secs = ttl.as_secs(),
                    min_secs = min.as_secs(),
                    "Terminal TTL shorter than retention, raising it"
                );
                self.terminal_ttl = Some(min);
            }
        }
        self
    }
}

/// Job store client.
pub struct RedisJobStore {
    client: redis::Client,
    config: RedisStoreConfig,
}

impl RedisJobStore {
    /// Create a new store. Does not connect until first use.
    pub fn new(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> StoreResult<Self> {
        Self::new(RedisStoreConfig::from_env())
    }

    /// Redis key holding `id`'s record.
    pub fn key(&self, id: &JobId) -> String {
        format!("{}:{}", self.config.key_prefix, id)
    }

    /// Round-trip a PING so startup fails fast on a bad URL.
    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(StoreError::backend(format!("unexpected PING reply: {}", reply)));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn put(&self, id: &JobId, record: &JobRecord) -> StoreResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(record)?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(id)).arg(payload);
        if let Some(ttl) = self.config.terminal_ttl.filter(|_| record.is_terminal()) {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<()>(&mut conn).await?;

        Ok(())
    }

    async fn get(&self, id: &JobId) -> StoreResult<JobRecord> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = redis::cmd("GET")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await?;

        match payload {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    async fn delete(&self, id: &JobId) -> StoreResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let removed: i64 = redis::cmd("DEL")
            .arg(self.key(id))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn scan(&self, filter: RecordFilter<'_>) -> StoreResult<Vec<JobRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let pattern = format!("{}:*", self.config.key_prefix);

        // SCAN may repeat keys across iterations
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            let fresh: Vec<String> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();
            if !fresh.is_empty() {
                let payloads: Vec<Option<String>> = redis::cmd("MGET")
                    .arg(&fresh)
                    .query_async(&mut conn)
                    .await?;

                for (key, payload) in fresh.iter().zip(payloads) {
                    // Deleted between SCAN and MGET
                    let Some(json) = payload else { continue };
                    match serde_json::from_str::<JobRecord>(&json) {
                        Ok(record) if filter(&record) => records.push(record),
                        Ok(_) => {}
                        Err(e) => warn!(key = %key, error = %e, "Skipping unreadable job record"),
                    }
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(matched = records.len(), scanned = seen.len(), "Scanned job records");
        Ok(records)
    }
}
