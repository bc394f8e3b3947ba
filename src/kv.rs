//! KV client & pub/sub bus (C1)
//!
//! Thin abstraction over a pooled KV with publish/subscribe. Connections are
//! pooled; ops share a single pool with a bounded maximum. Grounded on the
//! teacher's `cache.rs` (exponential-backoff pool construction) with a
//! dedicated non-pooled connection factory added for pub/sub, since a
//! pub/sub connection must not be returned to the general-purpose pool.

use std::time::Duration;

use deadpool_redis::{
    redis::{AsyncCommands, Client},
    Config as DeadpoolConfig, Pool, Runtime,
};

use crate::config::KvConfig;
use crate::error::{Error, Result};

/// Pooled KV client plus a raw client used only for pub/sub connections.
pub struct Kv {
    pool: Pool,
    client: Client,
}

impl Kv {
    /// Build the connection pool with retry logic. A KV that never becomes
    /// reachable is a startup error, not a silent degraded mode.
    pub async fn connect(config: &KvConfig) -> Result<Self> {
        let pool = create_pool_with_retries(config, config.max_retries).await?;
        let client = Client::open(config.url.as_str())
            .map_err(|e| Error::KvPool(format!("invalid KV url: {e}")))?;

        Ok(Self { pool, client })
    }

    /// Acquire a pooled connection for a single operation or short sequence
    /// of operations.
    pub async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::KvPool(e.to_string()))
    }

    /// Open a dedicated (non-pooled) connection suitable for `into_pubsub`.
    pub async fn pubsub_connection(&self) -> Result<deadpool_redis::redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(Error::Kv)
    }

    /// Whether the pool currently has at least one reachable connection,
    /// used by the health endpoint.
    pub async fn is_healthy(&self) -> bool {
        match self.connection().await {
            Ok(mut conn) => AsyncCommands::get::<_, Option<String>>(&mut conn, "__healthcheck__")
                .await
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Current pool status, surfaced by the health endpoint without
    /// duplicating pooling logic.
    pub fn pool_status(&self) -> deadpool_redis::Status {
        self.pool.status()
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    pub async fn hset_multiple(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<std::collections::HashMap<String, String>> {
        let mut conn = self.connection().await?;
        Ok(conn.hgetall(key).await?)
    }

    pub async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.hdel(key, field).await?;
        Ok(())
    }

    pub async fn expire(&self, key: &str, ttl_secs: i64) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.expire(key, ttl_secs).await?;
        Ok(())
    }

    /// Scan for all keys matching a glob pattern. Used by the reaper's
    /// periodic sweeps; pattern-scan rather than `KEYS` so a large keyspace
    /// does not block the KV under load.
    pub async fn scan_match(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection().await?;
        let iter: deadpool_redis::redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        Ok(iter.collect().await)
    }
}

use futures::StreamExt;

/// Create a KV connection pool with configurable retries, exponential
/// backoff between attempts.
async fn create_pool_with_retries(config: &KvConfig, max_retries: u32) -> Result<Pool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!("KV connection established after {} attempt(s)", attempt + 1);
                } else {
                    tracing::info!(
                        "KV connection pool created: max_connections={}",
                        config.max_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > max_retries {
                    tracing::error!("failed to connect to KV after {} attempts: {}", max_retries + 1, e);
                    return Err(e);
                }

                let delay_multiplier = 2_u32.pow(attempt.saturating_sub(1));
                let delay = base_delay * delay_multiplier;

                tracing::warn!(
                    "KV connection attempt {} failed: {}. retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &KvConfig) -> Result<Pool> {
    let cfg = DeadpoolConfig::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| Error::KvPool(format!("failed to build KV pool: {e}")))?
        .max_size(config.max_connections)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::KvPool(format!("failed to create KV pool: {e}")))?;

    let conn = pool
        .get()
        .await
        .map_err(|e| Error::KvPool(format!("failed to get KV connection: {e}")))?;
    drop(conn);

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_config_retry_defaults() {
        let config = KvConfig {
            url: "redis://localhost:6379".to_string(),
            max_connections: 1000,
            connection_timeout_secs: 10,
            max_retries: 5,
            retry_delay_secs: 2,
        };

        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.max_retries, 5);
    }
}
