//! Pool configuration schema
//!
//! Persisted through the store so operators can retune the pool at runtime.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use super::chip::MessageType;

/// Minimum trust per message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustThresholds {
    pub prospecting: u8,
    pub followup: u8,
    pub reply: u8,
}

impl TrustThresholds {
    pub fn for_type(&self, message_type: MessageType) -> u8 {
        match message_type {
            MessageType::Prospecting => self.prospecting,
            MessageType::Followup => self.followup,
            MessageType::Reply => self.reply,
        }
    }
}

/// Minimum number of available chips per capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityMinimums {
    pub prospecting: u32,
    pub followup: u32,
    pub reply: u32,
}

impl CapabilityMinimums {
    pub fn for_type(&self, message_type: MessageType) -> u32 {
        match message_type {
            MessageType::Prospecting => self.prospecting,
            MessageType::Followup => self.followup,
            MessageType::Reply => self.reply,
        }
    }
}

/// Thresholds used by the health monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Response rate below this raises an alert
    pub response_rate_floor: f64,
    /// Error rate above this raises an alert
    pub error_rate_ceiling: f64,
    /// Rates are only judged after this many rolling sends
    pub min_sample: u32,
    /// Trust points lost within 24h that raise an alert
    pub trust_drop_24h: u8,
    /// Fraction of operational chips that must be healthy
    pub healthy_fraction_floor: f64,
    /// Consecutive breaker failures that force a demotion
    pub breaker_demote_failures: u32,
    /// Rolling error counters reset after this long without errors
    pub quiet_reset_hours: i64,
    /// Open alerts older than this are expired
    pub alert_expiry_hours: i64,
    /// Minimum gap between two pool-level alerts of the same kind
    pub pool_alert_cooldown_minutes: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            response_rate_floor: 0.05,
            error_rate_ceiling: 0.20,
            min_sample: 20,
            trust_drop_24h: 15,
            healthy_fraction_floor: 0.5,
            breaker_demote_failures: 5,
            quiet_reset_hours: 6,
            alert_expiry_hours: 48,
            pool_alert_cooldown_minutes: 60,
        }
    }
}

impl HealthThresholds {
    pub fn quiet_reset(&self) -> Duration {
        Duration::hours(self.quiet_reset_hours)
    }

    pub fn alert_expiry(&self) -> Duration {
        Duration::hours(self.alert_expiry_hours)
    }

    pub fn pool_alert_cooldown(&self) -> Duration {
        Duration::minutes(self.pool_alert_cooldown_minutes)
    }
}

/// Pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Active chips production needs
    pub min_active: u32,
    /// Hard cap on active chips
    pub max_active: u32,
    /// Ready chips kept in reserve before the pool counts as warning
    pub min_ready_buffer: u32,
    /// Chips that should be provisioned or warming at any time
    pub warming_buffer_target: u32,
    pub min_available: CapabilityMinimums,
    /// Primary trust thresholds per message type
    pub trust: TrustThresholds,
    /// Relaxed thresholds for the fallback selection pass
    pub fallback_trust: TrustThresholds,
    /// Trust needed to leave warmup and to act as a replacement
    pub trust_ready: u8,
    /// Active chips below this are replaced
    pub trust_degraded: u8,
    /// Chips below this are demoted outright
    pub trust_critical: u8,
    pub warmup_duration_hours: i64,
    pub auto_provision: bool,
    /// Max identities requested per cycle
    pub provision_batch_limit: u32,
    /// Trust assigned on reactivation
    pub reactivation_trust: u8,
    #[serde(default)]
    pub health: HealthThresholds,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_active: 3,
            max_active: 10,
            min_ready_buffer: 1,
            warming_buffer_target: 2,
            min_available: CapabilityMinimums {
                prospecting: 1,
                followup: 1,
                reply: 1,
            },
            trust: TrustThresholds {
                prospecting: 80,
                followup: 60,
                reply: 40,
            },
            fallback_trust: TrustThresholds {
                prospecting: 60,
                followup: 40,
                reply: 20,
            },
            trust_ready: 70,
            trust_degraded: 50,
            trust_critical: 20,
            warmup_duration_hours: 14 * 24,
            auto_provision: false,
            provision_batch_limit: 3,
            reactivation_trust: 40,
            health: HealthThresholds::default(),
        }
    }
}

impl PoolConfig {
    /// Trust threshold for a message type in the primary or fallback pass
    pub fn threshold(&self, message_type: MessageType, fallback: bool) -> u8 {
        if fallback {
            self.fallback_trust.for_type(message_type)
        } else {
            self.trust.for_type(message_type)
        }
    }

    pub fn warmup_duration(&self) -> Duration {
        Duration::hours(self.warmup_duration_hours)
    }

    /// Sanity checks applied before a config is persisted
    pub fn validate(&self) -> Result<(), String> {
        if self.min_active > self.max_active {
            return Err("min_active must be less than or equal to max_active".to_string());
        }
        if self.trust_critical > self.trust_degraded || self.trust_degraded > self.trust_ready {
            return Err("trust thresholds must satisfy critical <= degraded <= ready".to_string());
        }
        for message_type in MessageType::ALL {
            if self.fallback_trust.for_type(message_type) > self.trust.for_type(message_type) {
                return Err(format!(
                    "fallback threshold for {} must not exceed the primary threshold",
                    message_type
                ));
            }
        }
        let all = [
            self.trust_ready,
            self.trust_degraded,
            self.trust_critical,
            self.reactivation_trust,
        ];
        if all.iter().any(|t| *t > 100) {
            return Err("trust thresholds must be within 0..=100".to_string());
        }
        if !(0.0..=1.0).contains(&self.health.healthy_fraction_floor) {
            return Err("healthy_fraction_floor must be within 0.0..=1.0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = PoolConfig::default();
        assert_eq!(config.threshold(MessageType::Prospecting, false), 80);
        assert_eq!(config.threshold(MessageType::Prospecting, true), 60);
        assert_eq!(config.threshold(MessageType::Followup, true), 40);
        assert_eq!(config.threshold(MessageType::Reply, true), 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let config = PoolConfig {
            min_active: 5,
            max_active: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = PoolConfig::default();
        config.fallback_trust.reply = 90;
        assert!(config.validate().is_err());
    }
}
