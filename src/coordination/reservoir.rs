//! Atomic TTL counters

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::clock::{to_chrono, Clock};
use crate::types::Result;

/// Shared counters keyed by string, each expiring after the TTL set on creation
#[async_trait]
pub trait RateReservoir: Send + Sync {
    /// Atomically increment and return the new count. The TTL applies when
    /// the key is created (or re-created after expiry).
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64>;

    /// Atomically decrement, never below zero; returns the new count
    async fn decrement(&self, key: &str) -> Result<u64>;

    /// Current count (0 if absent or expired)
    async fn current(&self, key: &str) -> Result<u64>;

    /// Remove a key outright
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Process-local reservoir
pub struct InMemoryReservoir {
    counters: DashMap<String, Counter>,
    clock: Arc<dyn Clock>,
}

impl InMemoryReservoir {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Drop expired counters
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, c| c.expires_at > now);
        before - self.counters.len()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl RateReservoir for InMemoryReservoir {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = self.clock.now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now + to_chrono(ttl),
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + to_chrono(ttl);
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn decrement(&self, key: &str) -> Result<u64> {
        let now = self.clock.now();
        match self.counters.get_mut(key) {
            Some(mut entry) if entry.expires_at > now => {
                entry.count = entry.count.saturating_sub(1);
                Ok(entry.count)
            }
            _ => Ok(0),
        }
    }

    async fn current(&self, key: &str) -> Result<u64> {
        let now = self.clock.now();
        Ok(self
            .counters
            .get(key)
            .filter(|c| c.expires_at > now)
            .map(|c| c.count)
            .unwrap_or(0))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.counters.remove(key);
        Ok(())
    }
}

/// Periodically drop expired counters so dedup and reservation keys do not
/// accumulate
pub fn spawn_reservoir_purge_task(
    reservoir: Arc<InMemoryReservoir>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Reservoir purge started");
        loop {
            tokio::time::sleep(interval).await;
            let purged = reservoir.purge_expired();
            if purged > 0 {
                debug!(purged, remaining = reservoir.len(), "Purged expired counters");
            }
        }
    })
}
