//! Cross-instance coordination primitives
//!
//! - [`RateReservoir`] - TTL-scoped atomic counters used for rate reservations
//!   and dedup keys
//! - [`MutualExclusionLock`] - leased lock that keeps orchestration cycles
//!   from overlapping across instances
//!
//! The in-memory implementations share state only within one process; a
//! deployment with several instances plugs in a shared backend behind the
//! same traits.

pub mod lock;
pub mod reservoir;

pub use lock::{AcquireMode, InMemoryLock, LockLease, MutualExclusionLock};
pub use reservoir::{spawn_reservoir_purge_task, InMemoryReservoir, RateReservoir};
