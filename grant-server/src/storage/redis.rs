use super::{RecordStore, StorageError};
use async_trait::async_trait;
use log::error;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Record store shared between server instances through Redis
#[derive(Clone)]
pub struct RedisStore {
    conn_manager: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server answers PING
    pub async fn new(redis_url: &str) -> Result<Self, String> {
        let client =
            Client::open(redis_url).map_err(|err| format!("Failed to connect to Redis: {err}"))?;

        let conn_manager = ConnectionManager::new(client)
            .await
            .map_err(|err| format!("Failed to create Redis connection manager: {err}"))?;

        let mut conn = conn_manager.clone();
        if let Err(err) = redis::cmd("PING").query_async::<String>(&mut conn).await {
            return Err(format!("Failed to ping Redis: {err}"));
        }

        Ok(Self { conn_manager })
    }
}

fn decode<T: DeserializeOwned>(value: Option<String>) -> Result<Option<T>, StorageError> {
    match value {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| StorageError::Deserialization(e.to_string()))
            .map(Some),
        None => Ok(None),
    }
}

fn redis_error(operation: &str, key: &str, err: redis::RedisError) -> StorageError {
    error!("Redis error while {operation} key {key}: {err}");
    StorageError::Redis(err.to_string())
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn put<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let serialized = serde_json::to_string(value)?;
        let mut conn = self.conn_manager.clone();

        let result = match ttl {
            // SETEX rejects zero, and sub-second TTLs round up
            Some(ttl) => {
                let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
                conn.set_ex::<_, _, ()>(key, serialized, secs.max(1)).await
            }
            None => conn.set::<_, _, ()>(key, serialized).await,
        };
        result.map_err(|err| redis_error("setting", key, err))
    }

    async fn get<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let mut conn = self.conn_manager.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|err| redis_error("getting", key, err))?;
        decode(value)
    }

    async fn take<T: DeserializeOwned + Send + Sync>(
        &self,
        key: &str,
    ) -> Result<Option<T>, StorageError> {
        let mut conn = self.conn_manager.clone();
        let value: Option<String> = redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_error("taking", key, err))?;
        decode(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.conn_manager.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|err| redis_error("deleting", key, err))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn_manager.clone();
        conn.keys(format!("{prefix}*"))
            .await
            .map_err(|err| redis_error("listing", prefix, err))
    }

    async fn health_check(&self) -> Result<(), String> {
        let mut conn = self.conn_manager.clone();
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(_) => Ok(()),
            Err(err) => Err(format!("Redis health check failed: {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis_test::server::RedisServer;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestData {
        field: String,
    }

    fn get_redis_url(server: &RedisServer) -> String {
        match &server.addr {
            redis::ConnectionAddr::Tcp(host, port) => format!("redis://{host}:{port}/"),
            _ => "redis://127.0.0.1:6379/".to_string(),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_record_operations() {
        let server = RedisServer::new();
        let store = RedisStore::new(&get_redis_url(&server)).await.unwrap();

        let data = TestData {
            field: "test".to_string(),
        };

        store
            .put("par:1", &data, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        let retrieved: TestData = store.get("par:1").await.unwrap().unwrap();
        assert_eq!(data, retrieved);
        assert_eq!(store.keys("par:").await.unwrap(), vec!["par:1".to_string()]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(store.get::<TestData>("par:1").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_take_removes_record() {
        let server = RedisServer::new();
        let store = RedisStore::new(&get_redis_url(&server)).await.unwrap();
        let data = TestData {
            field: "code".to_string(),
        };

        store.put("code:1", &data, None).await.unwrap();
        let first: Option<TestData> = store.take("code:1").await.unwrap();
        let second: Option<TestData> = store.take("code:1").await.unwrap();
        assert_eq!(first, Some(data));
        assert!(second.is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_health_check() {
        let server = RedisServer::new();
        let store = RedisStore::new(&get_redis_url(&server)).await.unwrap();

        let result = store.health_check().await;
        assert!(result.is_ok(), "health check failed: {:?}", result);
    }
}
