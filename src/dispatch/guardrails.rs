//! Consent and pacing guardrails

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::{normalize_destination, OutboundMessage};
use crate::db::schemas::{BlockReason, MessageType};
use crate::db::Store;
use crate::types::Result;

/// Guardrail thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Minimum gap between non-reply touches to one destination
    pub cooling_off: Duration,
    /// Non-reply contacts allowed per destination inside `contact_cap_window`
    pub contact_cap: u32,
    pub contact_cap_window: Duration,
    /// Minimum gap between touches of the same campaign to one destination
    pub campaign_cooldown: Duration,
    /// Start with safe mode on
    pub safe_mode: bool,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            cooling_off: Duration::hours(24),
            contact_cap: 3,
            contact_cap_window: Duration::days(30),
            campaign_cooldown: Duration::days(7),
            safe_mode: false,
        }
    }
}

/// Decides which guardrails deny a message.
///
/// Returns every applicable denial in evaluation order; an empty list allows
/// the send.
#[async_trait]
pub trait GuardrailPolicy: Send + Sync {
    async fn evaluate(&self, message: &OutboundMessage, now: DateTime<Utc>)
        -> Result<Vec<BlockReason>>;
}

/// Store-backed guardrails.
///
/// Opt-out applies to every message. Pacing rules and safe mode only gate
/// outreach; replies inside a conversation are never paced.
pub struct StandardGuardrails {
    store: Arc<dyn Store>,
    config: GuardrailConfig,
    safe_mode: AtomicBool,
}

impl StandardGuardrails {
    pub fn new(store: Arc<dyn Store>, config: GuardrailConfig) -> Self {
        let safe_mode = AtomicBool::new(config.safe_mode);
        Self {
            store,
            config,
            safe_mode,
        }
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    pub fn set_safe_mode(&self, enabled: bool) {
        let previous = self.safe_mode.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            if enabled {
                warn!("Safe mode enabled, outreach is paused");
            } else {
                info!("Safe mode disabled");
            }
        }
    }
}

#[async_trait]
impl GuardrailPolicy for StandardGuardrails {
    async fn evaluate(
        &self,
        message: &OutboundMessage,
        now: DateTime<Utc>,
    ) -> Result<Vec<BlockReason>> {
        let destination = normalize_destination(&message.destination);
        let destination = destination.as_str();

        if self.store.is_opted_out(destination).await? {
            return Ok(vec![BlockReason::OptOut]);
        }
        if message.message_type == MessageType::Reply {
            return Ok(Vec::new());
        }

        let mut denials = Vec::new();
        let touch = self.store.touch_state(destination).await?;

        if let Some(touch) = &touch {
            if touch.last_touch_at > now - self.config.cooling_off {
                denials.push(BlockReason::CoolingOff);
            }
        }

        let since = now - self.config.contact_cap_window;
        let contacts = self.store.count_contacts_since(destination, since).await?;
        if contacts >= self.config.contact_cap {
            denials.push(BlockReason::ContactCap);
        }

        if let (Some(campaign), Some(touch)) = (message.campaign_id.as_deref(), &touch) {
            if touch.campaign_id.as_deref() == Some(campaign)
                && touch.last_touch_at > now - self.config.campaign_cooldown
            {
                denials.push(BlockReason::CampaignCooldown);
            }
        }

        if self.safe_mode() {
            denials.push(BlockReason::SafeMode);
        }

        Ok(denials)
    }
}
