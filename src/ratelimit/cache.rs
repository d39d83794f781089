//! Local admission cache.
//!
//! Holds, per key, a reservation covering a slice of the shared counter's
//! quota so most checks can be answered from process memory. Entries expire
//! passively: a lookup treats an expired reservation as absent. Reservations
//! for keys that never come back are reclaimed by a sweep that `install` runs
//! once enough new reservations have accumulated since the last one.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::rules::MAX_WINDOW;

/// Fewest installs between two sweeps of expired reservations.
const MIN_SWEEP_INTERVAL: usize = 1024;

/// A local lease on `bucket_size` calls, valid until `expires_at`.
#[derive(Debug)]
struct Reservation {
    remaining: AtomicU64,
    expires_at: Instant,
}

impl Reservation {
    fn new(remaining: u64, ttl: Duration) -> Self {
        Self {
            remaining: AtomicU64::new(remaining),
            expires_at: Instant::now() + ttl.min(MAX_WINDOW),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    /// Take one unit. The last unit is never handed out so that running low
    /// forces a fresh authoritative check.
    fn try_take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 1).then(|| n - 1)
            })
            .is_ok()
    }
}

/// Process-wide map from key to local reservation.
///
/// Keys are sharded independently; decrements on one key never contend with
/// another key.
#[derive(Debug, Default)]
pub struct LocalAdmissionCache {
    reservations: DashMap<String, Reservation>,
    installs_since_sweep: AtomicUsize,
    sweep_after: AtomicUsize,
}

impl LocalAdmissionCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one unit from a live reservation for `key`.
    ///
    /// Returns `false` if there is no reservation, it has expired, or only its
    /// last unit is left.
    pub fn try_consume(&self, key: &str) -> bool {
        let now = Instant::now();

        match self.reservations.get(key) {
            None => return false,
            Some(reservation) if reservation.is_live(now) => return reservation.try_take(),
            Some(_) => {}
        }

        // The read guard is gone; drop the expired entry unless it was replaced.
        self.reservations.remove_if(key, |_, r| !r.is_live(now));
        false
    }

    /// Create or replace the reservation for `key`.
    ///
    /// Every so often this also sweeps out expired reservations. The interval
    /// grows with the number of live entries, so the sweep stays amortized
    /// constant time per install.
    pub fn install(&self, key: &str, bucket_size: u64, ttl: Duration) {
        self.reservations
            .insert(key.to_string(), Reservation::new(bucket_size, ttl));

        let installs = self.installs_since_sweep.fetch_add(1, Ordering::Relaxed) + 1;
        let threshold = self
            .sweep_after
            .load(Ordering::Relaxed)
            .max(MIN_SWEEP_INTERVAL);
        if installs >= threshold {
            self.installs_since_sweep.store(0, Ordering::Relaxed);
            let removed = self.purge_expired();
            self.sweep_after
                .store(self.reservations.len(), Ordering::Relaxed);
            debug!(removed, "Swept expired reservations");
        }
    }

    /// Remove every expired reservation and return how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.reservations.len();
        self.reservations.retain(|_, r| r.is_live(now));
        before.saturating_sub(self.reservations.len())
    }

    /// Drop the reservation for `key`.
    pub fn invalidate(&self, key: &str) {
        self.reservations.remove(key);
    }

    /// Units left on the live reservation for `key`, if any.
    pub fn remaining(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.reservations
            .get(key)
            .filter(|r| r.is_live(now))
            .map(|r| r.remaining.load(Ordering::SeqCst))
    }

    /// Number of live reservations.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.reservations.iter().filter(|r| r.is_live(now)).count()
    }

    /// Whether there are no live reservations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every reservation. Always safe: the shared store stays authoritative.
    pub fn clear(&self) {
        self.reservations.clear();
    }
}
