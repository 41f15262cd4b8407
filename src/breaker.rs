//! Per-chip circuit breaker
//!
//! Tracks consecutive send failures per chip and gates traffic:
//!
//! ```text
//! closed --(failure_threshold consecutive failures)--> open
//! open   --(open_duration elapsed)-------------------> half-open
//! half-open --(success_threshold successes)----------> closed
//! half-open --(any failure)--------------------------> open
//! ```
//!
//! The open → half-open move happens lazily on the next read. The selector
//! treats only [`CircuitState::Open`] as ineligible; the dispatcher calls
//! [`CircuitBreaker::allow_request`] right before sending, which also limits
//! the number of in-flight half-open probes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::clock::{to_chrono, Clock};

/// Breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing
    pub open_duration: Duration,
    /// Concurrent trial requests allowed while half-open
    pub half_open_max_probes: u32,
    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(300),
            half_open_max_probes: 1,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view of one chip's circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub chip_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    probes_in_flight: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            probes_in_flight: 0,
            opened_at: None,
        }
    }
}

impl Circuit {
    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
        self.probes_in_flight = 0;
    }

    fn close(&mut self) {
        *self = Circuit::default();
    }
}

/// Circuit breakers for every chip
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, Circuit>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            clock,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Open → half-open once the open window has elapsed
    fn refresh(&self, circuit: &mut Circuit, now: DateTime<Utc>) {
        if circuit.state != CircuitState::Open {
            return;
        }
        let elapsed = circuit
            .opened_at
            .map_or(true, |at| now - at >= to_chrono(self.config.open_duration));
        if elapsed {
            circuit.state = CircuitState::HalfOpen;
            circuit.half_open_successes = 0;
            circuit.probes_in_flight = 0;
        }
    }

    pub fn state(&self, chip_id: &str) -> CircuitState {
        let now = self.clock.now();
        match self.circuits.get_mut(chip_id) {
            Some(mut circuit) => {
                self.refresh(&mut circuit, now);
                circuit.state
            }
            None => CircuitState::Closed,
        }
    }

    pub fn is_open(&self, chip_id: &str) -> bool {
        self.state(chip_id) == CircuitState::Open
    }

    /// Gate one request. In half-open this takes a probe slot which the
    /// following `record_success`/`record_failure` returns.
    pub fn allow_request(&self, chip_id: &str) -> bool {
        let now = self.clock.now();
        let mut circuit = self.circuits.entry(chip_id.to_string()).or_default();
        self.refresh(&mut circuit, now);
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if circuit.probes_in_flight < self.config.half_open_max_probes {
                    circuit.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, chip_id: &str) {
        let now = self.clock.now();
        let mut circuit = self.circuits.entry(chip_id.to_string()).or_default();
        self.refresh(&mut circuit, now);
        match circuit.state {
            CircuitState::Closed => circuit.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                circuit.probes_in_flight = circuit.probes_in_flight.saturating_sub(1);
                circuit.half_open_successes += 1;
                if circuit.half_open_successes >= self.config.success_threshold {
                    circuit.close();
                    info!(chip_id = %chip_id, "Circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, chip_id: &str) {
        let now = self.clock.now();
        let mut circuit = self.circuits.entry(chip_id.to_string()).or_default();
        self.refresh(&mut circuit, now);
        circuit.consecutive_failures += 1;
        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= self.config.failure_threshold {
                    circuit.open(now);
                    warn!(
                        chip_id = %chip_id,
                        failures = circuit.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.open(now);
                warn!(chip_id = %chip_id, "Half-open probe failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Give back a half-open probe slot for a request that neither
    /// succeeded nor failed on the chip's account
    pub fn release_probe(&self, chip_id: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(chip_id) {
            if circuit.state == CircuitState::HalfOpen {
                circuit.probes_in_flight = circuit.probes_in_flight.saturating_sub(1);
            }
        }
    }

    pub fn consecutive_failures(&self, chip_id: &str) -> u32 {
        self.circuits
            .get(chip_id)
            .map(|c| c.consecutive_failures)
            .unwrap_or(0)
    }

    /// Forget a chip's history (used on reactivation)
    pub fn reset(&self, chip_id: &str) {
        self.circuits.remove(chip_id);
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = self.clock.now();
        let mut snapshots: Vec<_> = self
            .circuits
            .iter_mut()
            .map(|mut entry| {
                self.refresh(&mut entry, now);
                CircuitSnapshot {
                    chip_id: entry.key().clone(),
                    state: entry.state,
                    consecutive_failures: entry.consecutive_failures,
                    opened_at: entry.opened_at,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.chip_id.cmp(&b.chip_id));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn breaker() -> (Arc<ManualClock>, CircuitBreaker) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        ));
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default(), clock.clone());
        (clock, breaker)
    }

    #[test]
    fn test_opens_after_threshold() {
        let (_, b) = breaker();
        for _ in 0..4 {
            b.record_failure("c1");
        }
        assert_eq!(b.state("c1"), CircuitState::Closed);
        b.record_failure("c1");
        assert!(b.is_open("c1"));
        assert!(!b.allow_request("c1"));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let (_, b) = breaker();
        for _ in 0..4 {
            b.record_failure("c1");
        }
        b.record_success("c1");
        assert_eq!(b.consecutive_failures("c1"), 0);
        b.record_failure("c1");
        assert_eq!(b.state("c1"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_limits_probes_and_closes() {
        let (clock, b) = breaker();
        for _ in 0..5 {
            b.record_failure("c1");
        }
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(b.state("c1"), CircuitState::HalfOpen);

        assert!(b.allow_request("c1"));
        assert!(!b.allow_request("c1"));
        b.record_success("c1");
        assert_eq!(b.state("c1"), CircuitState::HalfOpen);

        assert!(b.allow_request("c1"));
        b.record_success("c1");
        assert_eq!(b.state("c1"), CircuitState::Closed);
        assert_eq!(b.consecutive_failures("c1"), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (clock, b) = breaker();
        for _ in 0..5 {
            b.record_failure("c1");
        }
        clock.advance(chrono::Duration::minutes(6));
        assert!(b.allow_request("c1"));
        b.record_failure("c1");
        assert!(b.is_open("c1"));

        clock.advance(chrono::Duration::minutes(4));
        assert!(b.is_open("c1"));
    }

    #[test]
    fn test_reset_forgets_history() {
        let (_, b) = breaker();
        for _ in 0..5 {
            b.record_failure("c1");
        }
        b.reset("c1");
        assert_eq!(b.state("c1"), CircuitState::Closed);
        assert!(b.snapshot().is_empty());
    }
}
