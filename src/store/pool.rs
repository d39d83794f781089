//! Bounded connection pool for the Redis counter store.
//!
//! At most `max_total` connections are borrowed at once; callers beyond that
//! wait up to `max_wait` for one to be returned. Returned connections are kept
//! for reuse up to `max_idle`, and `min_idle` are opened eagerly by `warm_up`.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::StoreError;
use crate::config::PoolConfig;

/// Shared, bounded pool of store connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    client: Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
    permits: Arc<Semaphore>,
    config: PoolConfig,
    connect_timeout: Duration,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections currently borrowed
    pub in_use: usize,
    /// Connections parked for reuse
    pub idle: usize,
    /// Upper bound on borrowed connections
    pub max_total: usize,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool. No connection is opened until `warm_up` or `get`.
    pub fn new(client: Client, config: PoolConfig, connect_timeout: Duration) -> Self {
        info!(
            max_total = config.max_total,
            max_idle = config.max_idle,
            min_idle = config.min_idle,
            max_wait_ms = config.max_wait_ms,
            "Creating store connection pool"
        );

        Self {
            inner: Arc::new(PoolInner {
                client,
                idle: Mutex::new(Vec::with_capacity(config.max_idle)),
                permits: Arc::new(Semaphore::new(config.max_total)),
                config,
                connect_timeout,
            }),
        }
    }

    /// Open `min_idle` connections up front.
    ///
    /// Failures are logged and stop the warm-up; they are never fatal, so a
    /// limiter can start while the store is down. Returns the number of idle
    /// connections afterwards.
    pub async fn warm_up(&self) -> usize {
        let wanted = self
            .inner
            .config
            .min_idle
            .saturating_sub(self.inner.idle.lock().len());

        for _ in 0..wanted {
            match self.connect().await {
                Ok(conn) => self.inner.idle.lock().push(conn),
                Err(e) => {
                    warn!(error = %e, "Failed to open initial store connection");
                    break;
                }
            }
        }

        let idle = self.inner.idle.lock().len();
        info!(idle, "Store connection pool warmed up");
        idle
    }

    /// Borrow a connection, waiting up to `max_wait` for a free slot.
    ///
    /// The connection goes back to the pool when the guard is dropped.
    pub async fn get(&self) -> Result<PooledConnection, StoreError> {
        let permit = self.reserve().await?;

        let reused = self.inner.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            broken: false,
            _permit: permit,
        })
    }

    /// Current pool occupancy.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            in_use: self.inner.config.max_total - self.inner.permits.available_permits(),
            idle: self.inner.idle.lock().len(),
            max_total: self.inner.config.max_total,
        }
    }

    async fn reserve(&self) -> Result<OwnedSemaphorePermit, StoreError> {
        let max_wait = self.inner.config.max_wait();
        tokio::time::timeout(max_wait, self.inner.permits.clone().acquire_owned())
            .await
            .map_err(|_| StoreError::PoolTimeout(max_wait))?
            .map_err(|e| StoreError::Unavailable(format!("connection pool closed: {}", e)))
    }

    async fn connect(&self) -> Result<MultiplexedConnection, StoreError> {
        let timeout = self.inner.connect_timeout;
        let conn = tokio::time::timeout(timeout, self.inner.client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        debug!("Opened store connection");
        Ok(conn)
    }
}

/// A borrowed connection. Returned to the pool on drop unless marked broken.
pub struct PooledConnection {
    conn: Option<MultiplexedConnection>,
    pool: Arc<PoolInner>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Discard this connection instead of returning it for reuse.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledConnection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.broken {
            debug!("Dropping broken store connection");
            return;
        }

        let mut idle = self.pool.idle.lock();
        if idle.len() < self.pool.config.max_idle {
            idle.push(conn);
        }
    }
}
