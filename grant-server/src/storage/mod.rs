use crate::config::{StorageConfig, StorageStore};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod redis;

/// Errors that can occur while reading or writing records
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to parse record: {0}")]
    Deserialization(String),
    #[error("Redis error: {0}")]
    Redis(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Key/value persistence for pending requests, grants and authorization codes.
///
/// Records are stored as JSON. A `ttl` of `None` keeps the record until it is
/// deleted; otherwise the backend may drop it once the TTL elapses. Callers
/// still check their own expiry timestamps since backend eviction is lazy.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite a record
    async fn put<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// Read a record without removing it
    async fn get<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError>;

    /// Atomically read and remove a record.
    ///
    /// Of several concurrent callers for the same key at most one receives
    /// `Some`.
    async fn take<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError>;

    /// Remove a record, succeeding whether or not it existed
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List the keys that start with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Returns Ok(()) if the backend is reachable
    async fn health_check(&self) -> Result<(), String>;
}

/// Storage backend selected at startup
#[derive(Clone)]
pub enum Storage {
    /// Process-local store backed by Moka
    InMemory(memory::InMemoryStore),
    /// Shared store backed by Redis
    Redis(redis::RedisStore),
}

#[async_trait::async_trait]
impl RecordStore for Storage {
    async fn put<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        match self {
            Self::InMemory(store) => store.put(key, value, ttl).await,
            Self::Redis(store) => store.put(key, value, ttl).await,
        }
    }

    async fn get<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self {
            Self::InMemory(store) => store.get(key).await,
            Self::Redis(store) => store.get(key).await,
        }
    }

    async fn take<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        match self {
            Self::InMemory(store) => store.take(key).await,
            Self::Redis(store) => store.take(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self {
            Self::InMemory(store) => store.delete(key).await,
            Self::Redis(store) => store.delete(key).await,
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        match self {
            Self::InMemory(store) => store.keys(prefix).await,
            Self::Redis(store) => store.keys(prefix).await,
        }
    }

    async fn health_check(&self) -> Result<(), String> {
        match self {
            Self::InMemory(store) => store.health_check().await,
            Self::Redis(store) => store.health_check().await,
        }
    }
}

impl Storage {
    /// Fresh in-memory storage, mostly useful for tests
    pub fn in_memory(capacity_mib: usize) -> Result<Self, StorageError> {
        memory::InMemoryStore::new(capacity_mib)
            .map(Self::InMemory)
            .map_err(StorageError::Config)
    }
}

/// Build the storage backend named in the configuration
pub async fn create_storage(config: &StorageConfig) -> Result<Storage, StorageError> {
    match config.store {
        StorageStore::InMemory => Storage::in_memory(config.memory_capacity),
        StorageStore::Redis => {
            if config.redis_url.is_empty() {
                return Err(StorageError::Config(
                    "Redis URL is required for Redis storage".to_string(),
                ));
            }
            let store = redis::RedisStore::new(&config.redis_url)
                .await
                .map_err(StorageError::Config)?;
            Ok(Storage::Redis(store))
        }
    }
}
