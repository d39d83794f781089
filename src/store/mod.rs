//! Shared counter store client.
//!
//! The store is the source of truth for every key's call count across all
//! limiter instances. The limiter only needs three operations from it, all of
//! which must be safe under concurrent use from many processes.

mod memory;
mod pool;
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::{InMemoryCounterStore, StoreStats};
pub use self::pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use self::redis::RedisCounterStore;

/// Errors that can occur while talking to the shared counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect to store: {0}")]
    Connection(String),
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),
    #[error("Store request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// An external atomic counter service.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the current counter value, or `None` if the key does not exist
    /// (never incremented, deleted, or expired).
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Atomically add `increment_by` to the counter for `key`, creating it at
    /// zero first if absent. When the resulting value equals `increment_by`
    /// (this call created the counter) the key's time-to-live is set to `ttl`.
    ///
    /// Returns the post-increment value.
    async fn increment_with_expiry(
        &self,
        key: &str,
        increment_by: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError>;

    /// Remove the counter for `key` immediately.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
