use super::{RecordStore, StorageError};
use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use moka::Expiry;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Serialized record plus the TTL it was written with
#[derive(Clone)]
struct StoredRecord {
    json: String,
    ttl: Option<Duration>,
}

/// Applies each record's own TTL, on insert and on overwrite
struct PerRecordExpiry;

impl Expiry<String, StoredRecord> for PerRecordExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredRecord,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredRecord,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// Process-local store.
///
/// Records written with a TTL live in a size-bounded Moka cache and may be
/// evicted under memory pressure. Records without one (grants) live in a
/// plain map and stay until deleted.
#[derive(Clone)]
pub struct InMemoryStore {
    records: MokaCache<String, StoredRecord>,
    durable: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryStore {
    /// Initialize a new in-memory store bounded to `capacity_mib` MiB of JSON
    pub fn new(capacity_mib: usize) -> Result<Self, String> {
        let max_capacity_bytes: u64 = capacity_mib
            .checked_mul(1024 * 1024)
            .and_then(|bytes| u64::try_from(bytes).ok())
            .ok_or_else(|| format!("Capacity of {capacity_mib} MiB is too large"))?;

        let records = MokaCache::builder()
            .expire_after(PerRecordExpiry)
            .weigher(|key: &String, value: &StoredRecord| -> u32 {
                (key.len() + value.json.len())
                    .try_into()
                    .unwrap_or(u32::MAX)
            })
            .max_capacity(max_capacity_bytes)
            .build();

        Ok(Self {
            records,
            durable: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn durable_get(&self, key: &str) -> Option<String> {
        self.durable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn durable_remove(&self, key: &str) -> Option<String> {
        self.durable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }
}

fn decode<T: DeserializeOwned>(json: &str) -> Result<T, StorageError> {
    serde_json::from_str(json).map_err(|e| StorageError::Deserialization(e.to_string()))
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn put<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        match ttl {
            Some(_) => {
                self.records
                    .insert(key.to_string(), StoredRecord { json, ttl })
                    .await;
                self.durable_remove(key);
            }
            None => {
                self.durable
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.to_string(), json);
                self.records.invalidate(key).await;
            }
        }
        Ok(())
    }

    async fn get<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        if let Some(json) = self.durable_get(key) {
            return decode(&json).map(Some);
        }
        match self.records.get(key).await {
            Some(record) => decode(&record.json).map(Some),
            None => Ok(None),
        }
    }

    async fn take<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        if let Some(json) = self.durable_remove(key) {
            return decode(&json).map(Some);
        }
        match self.records.remove(key).await {
            Some(record) => decode(&record.json).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.durable_remove(key);
        self.records.invalidate(key).await;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .durable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.extend(
            self.records
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.to_string()),
        );
        Ok(keys)
    }

    async fn health_check(&self) -> Result<(), String> {
        Ok(())
    }
}
