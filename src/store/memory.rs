//! In-process counter store.
//!
//! Mirrors the Redis semantics (expiry armed only by the creating increment,
//! expired keys read as absent) so a single process can run without a server.
//! It also counts operations and can simulate an outage, which makes it the
//! store of choice for exercising the limiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use super::{CounterStore, StoreError};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Operation counts observed by an [`InMemoryCounterStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub gets: u64,
    pub increments: u64,
    pub deletes: u64,
}

impl StoreStats {
    /// Total store round-trips.
    pub fn round_trips(&self) -> u64 {
        self.gets + self.increments + self.deletes
    }
}

/// Counter store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
    gets: AtomicU64,
    increments: AtomicU64,
    deletes: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every operation fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Operation counts so far.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            gets: self.gets.load(Ordering::SeqCst),
            increments: self.increments.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    /// Time left before `key` expires; `None` if absent or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at - now)
    }

    /// Overwrite a counter without touching its expiry. Creates it without
    /// expiry if absent.
    pub fn set(&self, key: &str, value: u64) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key).filter(|e| e.is_live(now)) {
            Some(entry) => entry.value = value,
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value,
                        expires_at: None,
                    },
                );
            }
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value)),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn increment_with_expiry(
        &self,
        key: &str,
        increment_by: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        self.increments.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        if !entry.is_live(now) {
            *entry = Entry {
                value: 0,
                expires_at: None,
            };
        }

        entry.value += increment_by;
        if entry.value == increment_by {
            // A deadline past what `Instant` can hold means the key never expires.
            entry.expires_at = now.checked_add(ttl);
        }

        trace!(key = %key, increment_by, counter = entry.value, "Incremented in-memory counter");
        Ok(entry.value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        self.entries.lock().remove(key);
        Ok(())
    }
}
