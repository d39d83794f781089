//! Redis implementation of the shared counter store.

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client, RedisResult, Script};
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, info};

use super::pool::{ConnectionPool, PoolStatus, PooledConnection};
use super::{CounterStore, StoreError};
use crate::config::StoreConfig;

/// Increment by ARGV[1]; when that increment created the key, expire it after
/// ARGV[2] seconds. Runs atomically on the server.
const INCREMENT_WITH_EXPIRY: &str = r#"
local current = redis.call("INCRBY", KEYS[1], tonumber(ARGV[1]))
if current == tonumber(ARGV[1]) then
    redis.call("EXPIRE", KEYS[1], tonumber(ARGV[2]))
end
return current
"#;

/// Counter store backed by a Redis server.
#[derive(Debug, Clone)]
pub struct RedisCounterStore {
    pool: ConnectionPool,
    script: Script,
    request_timeout: Duration,
}

impl RedisCounterStore {
    /// Create a store client for the configured endpoint.
    ///
    /// This does not contact the server; call `warm_up` to open the minimum
    /// idle connections.
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        info!(url = %config.url(), "Creating Redis counter store");

        let client = Client::open(config.url())?;
        let pool = ConnectionPool::new(client, config.pool.clone(), config.request_timeout());

        Ok(Self {
            pool,
            script: Script::new(INCREMENT_WITH_EXPIRY),
            request_timeout: config.request_timeout(),
        })
    }

    /// Create a store client and open its minimum idle connections.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let store = Self::new(config)?;
        store.pool.warm_up().await;
        Ok(store)
    }

    /// Open the pool's minimum idle connections.
    pub async fn warm_up(&self) -> usize {
        self.pool.warm_up().await
    }

    /// Current connection pool occupancy.
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Turn the outcome of a timed request into a store result.
    ///
    /// A connection that failed or timed out is discarded rather than reused.
    fn settle<T>(
        &self,
        conn: &mut PooledConnection,
        outcome: Result<RedisResult<T>, Elapsed>,
    ) -> Result<T, StoreError> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    conn.mark_broken();
                }
                Err(StoreError::Redis(e))
            }
            Err(_) => {
                conn.mark_broken();
                Err(StoreError::Timeout(self.request_timeout))
            }
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.pool.get().await?;
        let outcome = timeout(self.request_timeout, conn.get(key)).await;
        let value: Option<u64> = self.settle(&mut conn, outcome)?;

        debug!(key = %key, current = ?value, "Read store counter");
        Ok(value)
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        increment_by: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let mut conn = self.pool.get().await?;
        let outcome = timeout(
            self.request_timeout,
            self.script
                .key(key)
                .arg(increment_by)
                .arg(ttl.as_secs().max(1))
                .invoke_async(&mut *conn),
        )
        .await;
        let value: u64 = self.settle(&mut conn, outcome)?;

        debug!(key = %key, increment_by, counter = value, "Incremented store counter");
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.get().await?;
        let outcome = timeout(self.request_timeout, conn.del(key)).await;
        let () = self.settle(&mut conn, outcome)?;

        debug!(key = %key, "Deleted store counter");
        Ok(())
    }
}
