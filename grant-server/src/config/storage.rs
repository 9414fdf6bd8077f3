use confique::Config;
use serde::Deserialize;

/// Specifies which record store implementation to use
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageStore {
    #[default]
    InMemory,
    Redis,
}

/// Configuration for request, grant and code persistence
#[derive(Debug, Config, Clone)]
pub struct StorageConfig {
    /// Store type: "in-memory" (default) or "redis"
    #[config(env = "GRANT_STORAGE_STORE", default = "in-memory")]
    pub store: StorageStore,

    /// Maximum in-memory capacity in MiB (default: 128 MiB)
    #[config(env = "GRANT_STORAGE_MEMORY_CAPACITY", default = 128)]
    pub memory_capacity: usize,

    /// Redis connection URL, required when store is "redis"
    #[config(env = "GRANT_STORAGE_REDIS_URL", default = "")]
    pub redis_url: String,
}
