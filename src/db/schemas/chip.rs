//! Chip schema
//!
//! A chip is one outbound sending identity (a phone-number-like channel) with
//! its own trust score, capability flags and rate limits.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Chip identifier
pub type ChipId = String;

/// Default trust for freshly provisioned identities
pub const DEFAULT_TRUST: u8 = 50;

/// Upper bound of the trust scale
pub const MAX_TRUST: u8 = 100;

// ============================================================================
// Lifecycle status
// ============================================================================

/// Lifecycle status of a chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipStatus {
    /// Identity registered, never connected
    Provisioned,
    /// Reactivated, waiting for a connection
    Pending,
    /// Connected and ramping up
    Warming,
    /// Warmed up, held in reserve
    Ready,
    /// Carrying production traffic
    Active,
    /// Pulled from production, awaiting replacement or rehabilitation
    Degraded,
    /// Banned by the provider
    Banned,
    /// Cancelled by an operator
    Cancelled,
}

impl ChipStatus {
    pub const ALL: [ChipStatus; 8] = [
        ChipStatus::Provisioned,
        ChipStatus::Pending,
        ChipStatus::Warming,
        ChipStatus::Ready,
        ChipStatus::Active,
        ChipStatus::Degraded,
        ChipStatus::Banned,
        ChipStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChipStatus::Provisioned => "provisioned",
            ChipStatus::Pending => "pending",
            ChipStatus::Warming => "warming",
            ChipStatus::Ready => "ready",
            ChipStatus::Active => "active",
            ChipStatus::Degraded => "degraded",
            ChipStatus::Banned => "banned",
            ChipStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states only leave through reactivation
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChipStatus::Banned | ChipStatus::Cancelled)
    }

    /// Whether `self -> to` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, to: ChipStatus) -> bool {
        use ChipStatus::*;
        match (*self, to) {
            (Provisioned, Warming) | (Pending, Warming) => true,
            (Warming, Ready) => true,
            (Ready, Active) => true,
            (Warming | Ready | Active, Degraded) => true,
            (Provisioned | Pending | Warming | Ready | Active | Degraded, Banned | Cancelled) => {
                true
            }
            // Reactivation
            (Banned | Cancelled | Degraded, Pending | Ready) => true,
            _ => false,
        }
    }

    /// Whether `self -> to` is a reactivation edge (requires a trust reset)
    pub fn is_reactivation(&self, to: ChipStatus) -> bool {
        matches!(
            (*self, to),
            (
                ChipStatus::Banned | ChipStatus::Cancelled | ChipStatus::Degraded,
                ChipStatus::Pending | ChipStatus::Ready
            )
        )
    }
}

impl fmt::Display for ChipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Classification enums
// ============================================================================

/// What the chip is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChipRole {
    /// Carries outbound traffic
    #[default]
    Sender,
    /// Listen-only; never routed outbound traffic
    Listener,
    /// Scrape-only; never routed outbound traffic
    Scraper,
}

/// Messaging backend behind a chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Official hosted business API
    CloudApi,
    /// Self-hosted web-session gateway
    WebSession,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::CloudApi => "cloud_api",
            ProviderKind::WebSession => "web_session",
        }
    }
}

/// Ramp-up sub-phase during warmup, ordered by progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WarmupPhase {
    #[default]
    Initial,
    Ramping,
    Operational,
}

/// Quality rating reported by the provider (red is worst)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    #[default]
    Green,
    Yellow,
    Red,
}

/// Kind of outbound message, each gated by its own capability and trust threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Prospecting,
    Followup,
    Reply,
}

impl MessageType {
    pub const ALL: [MessageType; 3] = [
        MessageType::Prospecting,
        MessageType::Followup,
        MessageType::Reply,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Prospecting => "prospecting",
            MessageType::Followup => "followup",
            MessageType::Reply => "reply",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_prospect: bool,
    pub can_followup: bool,
    pub can_reply: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::all()
    }
}

impl Capabilities {
    pub fn all() -> Self {
        Self {
            can_prospect: true,
            can_followup: true,
            can_reply: true,
        }
    }

    pub fn none() -> Self {
        Self {
            can_prospect: false,
            can_followup: false,
            can_reply: false,
        }
    }

    pub fn allows(&self, message_type: MessageType) -> bool {
        match message_type {
            MessageType::Prospecting => self.can_prospect,
            MessageType::Followup => self.can_followup,
            MessageType::Reply => self.can_reply,
        }
    }
}

// ============================================================================
// Rate counters
// ============================================================================

/// Hourly and daily send counters with rolling buckets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCounters {
    pub sent_this_hour: u32,
    /// Start of the hour `sent_this_hour` belongs to
    #[serde(default)]
    pub hour_bucket: Option<DateTime<Utc>>,
    pub sent_today: u32,
    #[serde(default)]
    pub day_bucket: Option<NaiveDate>,
    pub hourly_limit: u32,
    pub daily_limit: u32,
}

impl Default for RateCounters {
    fn default() -> Self {
        Self {
            sent_this_hour: 0,
            hour_bucket: None,
            sent_today: 0,
            day_bucket: None,
            hourly_limit: 20,
            daily_limit: 200,
        }
    }
}

/// Truncate a timestamp to the start of its hour
pub fn hour_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

impl RateCounters {
    /// Sends counted in the hour containing `now`
    pub fn hourly_at(&self, now: DateTime<Utc>) -> u32 {
        match self.hour_bucket {
            Some(bucket) if bucket == hour_start(now) => self.sent_this_hour,
            _ => 0,
        }
    }

    /// Sends counted on the day containing `now`
    pub fn daily_at(&self, now: DateTime<Utc>) -> u32 {
        match self.day_bucket {
            Some(day) if day == now.date_naive() => self.sent_today,
            _ => 0,
        }
    }

    pub fn under_caps(&self, now: DateTime<Utc>) -> bool {
        self.hourly_at(now) < self.hourly_limit && self.daily_at(now) < self.daily_limit
    }

    /// Count one send, rolling buckets forward when the hour or day changed
    pub fn register_send(&mut self, now: DateTime<Utc>) {
        let hour = hour_start(now);
        if self.hour_bucket != Some(hour) {
            self.hour_bucket = Some(hour);
            self.sent_this_hour = 0;
        }
        if self.day_bucket != Some(now.date_naive()) {
            self.day_bucket = Some(now.date_naive());
            self.sent_today = 0;
        }
        self.sent_this_hour += 1;
        self.sent_today += 1;
    }
}

/// Bucket label used for per-chip-per-hour reservation keys
pub fn hour_bucket_label(now: DateTime<Utc>) -> String {
    format!(
        "{:04}{:02}{:02}{:02}",
        now.year(),
        now.month(),
        now.day(),
        now.hour()
    )
}

// ============================================================================
// Chip record
// ============================================================================

/// Chip record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chip {
    pub id: ChipId,
    /// Sending identity (E.164-like number)
    pub phone_number: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub role: ChipRole,
    pub status: ChipStatus,
    pub trust_score: u8,
    /// Trust observed roughly 24h ago, for drop detection
    #[serde(default)]
    pub trust_score_24h_ago: Option<u8>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub counters: RateCounters,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub warmup_phase: WarmupPhase,
    #[serde(default)]
    pub warmup_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub quality_tier: QualityTier,
    /// Fraction of outbound messages that got a response (0.0 - 1.0)
    #[serde(default)]
    pub response_rate: Option<f64>,
    /// Sends since the rolling counters were last reset
    #[serde(default)]
    pub rolling_sent: u32,
    /// Errors since the rolling counters were last reset
    #[serde(default)]
    pub rolling_errors: u32,
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
}

impl Chip {
    /// Create a freshly provisioned chip
    pub fn new(
        id: impl Into<ChipId>,
        phone_number: impl Into<String>,
        provider: ProviderKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            phone_number: phone_number.into(),
            provider,
            role: ChipRole::Sender,
            status: ChipStatus::Provisioned,
            trust_score: DEFAULT_TRUST,
            trust_score_24h_ago: None,
            capabilities: Capabilities::all(),
            counters: RateCounters::default(),
            connected: false,
            cooldown_until: None,
            warmup_phase: WarmupPhase::Initial,
            warmup_started_at: None,
            quality_tier: QualityTier::Green,
            response_rate: None,
            rolling_sent: 0,
            rolling_errors: 0,
            last_error_at: None,
            last_activity_at: None,
            created_at: now,
            updated_at: now,
            status_changed_at: now,
        }
    }

    pub fn with_status(mut self, status: ChipStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_trust(mut self, trust: i32) -> Self {
        self.trust_score = clamp_trust(trust);
        self
    }

    pub fn with_role(mut self, role: ChipRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_limits(mut self, hourly: u32, daily: u32) -> Self {
        self.counters.hourly_limit = hourly;
        self.counters.daily_limit = daily;
        self
    }

    pub fn with_connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    pub fn with_warmup(mut self, phase: WarmupPhase, started_at: DateTime<Utc>) -> Self {
        self.warmup_phase = phase;
        self.warmup_started_at = Some(started_at);
        self
    }

    /// Sends attempted in the rolling window (successes plus failures)
    pub fn rolling_attempts(&self) -> u32 {
        self.rolling_sent + self.rolling_errors
    }

    /// Error ratio over the rolling window
    pub fn error_rate(&self) -> f64 {
        match self.rolling_attempts() {
            0 => 0.0,
            attempts => self.rolling_errors as f64 / attempts as f64,
        }
    }

    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    /// Time spent in warmup so far
    pub fn warmup_elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.warmup_started_at.map(|started| now - started)
    }
}

/// Clamp an arbitrary score into the trust range
pub fn clamp_trust(value: i32) -> u8 {
    value.clamp(0, MAX_TRUST as i32) as u8
}
