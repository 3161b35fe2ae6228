//! Redis-backed policy store.
//!
//! Each list is a Redis hash: membership is `HEXISTS`, listing is `HKEYS`,
//! counting is `HINCRBY`.

use std::collections::HashSet;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::{Error, Result};
use crate::policy::PolicyStore;

/// Policy store over a shared multiplexed Redis connection.
pub struct RedisPolicyStore {
    connection: MultiplexedConnection,
}

impl RedisPolicyStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/7`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::policy(format!("invalid redis url {}: {}", url, e)))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::policy(format!("redis connect failed: {}", e)))?;
        tracing::info!("policy store connected to {}", url);
        Ok(Self { connection })
    }
}

fn redis_err(e: redis::RedisError) -> Error {
    Error::policy(e.to_string())
}

#[async_trait]
impl PolicyStore for RedisPolicyStore {
    async fn is_member(&self, list: &str, key: &str) -> Result<bool> {
        let mut con = self.connection.clone();
        con.hexists(list, key).await.map_err(redis_err)
    }

    async fn keys(&self, list: &str) -> Result<HashSet<String>> {
        let mut con = self.connection.clone();
        con.hkeys(list).await.map_err(redis_err)
    }

    async fn increment(&self, list: &str, key: &str, amount: i64) -> Result<()> {
        let mut con = self.connection.clone();
        let _: i64 = con.hincr(list, key, amount).await.map_err(redis_err)?;
        Ok(())
    }
}
