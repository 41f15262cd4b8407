//! Leased mutual-exclusion lock

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::clock::{to_chrono, Clock};
use crate::types::Result;

/// How [`MutualExclusionLock::acquire`] waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Return immediately if held
    NonBlocking,
    /// Retry until acquired or the timeout elapses
    Blocking { timeout: Duration },
}

/// Proof of ownership. Only the holder of the token may release or extend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait MutualExclusionLock: Send + Sync {
    /// Acquire `key` for `lease`. Returns None if another holder keeps it.
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        mode: AcquireMode,
    ) -> Result<Option<LockLease>>;

    /// Release; false if the lease was no longer ours
    async fn release(&self, lease: &LockLease) -> Result<bool>;

    /// Push expiry out by `by` from now; false if the lease was lost
    async fn extend(&self, lease: &mut LockLease, by: Duration) -> Result<bool>;
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

/// Process-local lock
pub struct InMemoryLock {
    holders: DashMap<String, Holder>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl InMemoryLock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            holders: DashMap::new(),
            clock,
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn try_acquire(&self, key: &str, lease: Duration) -> Option<LockLease> {
        let now = self.clock.now();
        let holder = Holder {
            token: Uuid::new_v4(),
            expires_at: now + to_chrono(lease),
        };
        match self.holders.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(holder);
            }
            Entry::Occupied(mut slot) => {
                if slot.get().expires_at > now {
                    return None;
                }
                debug!(key = %key, "Taking over expired lock");
                slot.insert(holder);
            }
        }
        Some(LockLease {
            key: key.to_string(),
            token: holder.token,
            expires_at: holder.expires_at,
        })
    }
}

#[async_trait]
impl MutualExclusionLock for InMemoryLock {
    async fn acquire(
        &self,
        key: &str,
        lease: Duration,
        mode: AcquireMode,
    ) -> Result<Option<LockLease>> {
        match mode {
            AcquireMode::NonBlocking => Ok(self.try_acquire(key, lease)),
            AcquireMode::Blocking { timeout } => {
                let deadline = tokio::time::Instant::now() + timeout;
                loop {
                    if let Some(acquired) = self.try_acquire(key, lease) {
                        return Ok(Some(acquired));
                    }
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let max_jitter = self.poll_interval.as_millis() as u64 / 2;
                    let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter);
                    let wait = self.poll_interval + Duration::from_millis(jitter_ms);
                    tokio::time::sleep(wait.min(deadline - now)).await;
                }
            }
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<bool> {
        Ok(self
            .holders
            .remove_if(&lease.key, |_, h| h.token == lease.token)
            .is_some())
    }

    async fn extend(&self, lease: &mut LockLease, by: Duration) -> Result<bool> {
        let now = self.clock.now();
        match self.holders.get_mut(&lease.key) {
            Some(mut holder) if holder.token == lease.token && holder.expires_at > now => {
                holder.expires_at = now + to_chrono(by);
                lease.expires_at = holder.expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
