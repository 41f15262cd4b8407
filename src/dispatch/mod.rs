//! Outbound dispatch pipeline
//!
//! [`OutboundDispatcher::dispatch`] runs one message through a fixed sequence
//! of stages, each of which may end the dispatch with a terminal
//! [`DispatchOutcome`]:
//!
//! 1. Environment allowlist
//! 2. Content dedup window
//! 3. Consent and pacing guardrails (human-authorized bypass for pacing rules)
//! 4. Routing through the [`ChipSelector`] with an hourly reservation
//! 5. Send through the chip's [`Sender`](crate::sender::Sender)
//!
//! Whatever stage ends the dispatch, finalization runs exactly once: delivered
//! messages update touch attribution and chip counters, everything else gives
//! back the dedup and rate reservations it took, and every dispatch persists
//! one [`DispatchRecord`]. Infrastructure failures end the dispatch as `FATAL`
//! and are finalized the same way.

pub mod allowlist;
pub mod dedup;
pub mod guardrails;

pub use allowlist::{normalize_destination, Allowlist, Environment};
pub use dedup::{fingerprint, DedupWindow};
pub use guardrails::{GuardrailConfig, GuardrailPolicy, StandardGuardrails};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::clock::{to_chrono, Clock};
use crate::coordination::RateReservoir;
use crate::db::schemas::{
    BlockReason, ContactRecord, ConversationBinding, DispatchOutcome, DispatchRecord,
    MessageType, TouchState,
};
use crate::db::Store;
use crate::selector::{ChipSelector, SelectedChip, SelectionRequest};
use crate::sender::{MediaKind, SenderError, SenderRegistry};
use crate::types::{DispatchError, Result};

/// Cooldown applied when a provider throttles without a retry hint
const DEFAULT_THROTTLE_COOLDOWN: Duration = Duration::from_secs(60);

/// Message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    Text {
        body: String,
    },
    Media {
        url: String,
        #[serde(default)]
        caption: Option<String>,
        kind: MediaKind,
    },
}

/// One outbound message request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub request_id: Uuid,
    pub destination: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    pub payload: MessagePayload,
    /// A human approved this send; pacing guardrails may be overridden
    #[serde(default)]
    pub human_authorized: bool,
}

impl OutboundMessage {
    pub fn new(
        destination: impl Into<String>,
        message_type: MessageType,
        payload: MessagePayload,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            destination: destination.into(),
            message_type,
            conversation_id: None,
            campaign_id: None,
            payload,
            human_authorized: false,
        }
    }

    pub fn text(
        destination: impl Into<String>,
        message_type: MessageType,
        body: impl Into<String>,
    ) -> Self {
        Self::new(
            destination,
            message_type,
            MessagePayload::Text { body: body.into() },
        )
    }

    pub fn conversation(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = Some(id.into());
        self
    }

    pub fn campaign(mut self, id: impl Into<String>) -> Self {
        self.campaign_id = Some(id.into());
        self
    }

    pub fn human_authorized(mut self) -> Self {
        self.human_authorized = true;
        self
    }
}

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a fingerprint blocks identical content to the same destination
    pub dedup_window: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(24 * 3600),
        }
    }
}

/// Terminal result of one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub request_id: Uuid,
    pub outcome: DispatchOutcome,
    pub reason_code: String,
    pub chip_id: Option<String>,
    pub provider_message_id: Option<String>,
    pub fingerprint: Option<String>,
    pub bypassed: Option<BlockReason>,
    pub detail: Option<String>,
}

impl DispatchReport {
    pub fn is_delivered(&self) -> bool {
        self.outcome.is_delivered()
    }
}

/// Outcome counters
#[derive(Debug, Default)]
pub struct DispatcherStats {
    sent: AtomicU64,
    bypassed: AtomicU64,
    deduped: AtomicU64,
    blocked: AtomicU64,
    no_capacity: AtomicU64,
    rate_limited: AtomicU64,
    circuit_open: AtomicU64,
    provider_failed: AtomicU64,
    fatal: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStatsSnapshot {
    pub sent: u64,
    pub bypassed: u64,
    pub deduped: u64,
    pub blocked: u64,
    pub no_capacity: u64,
    pub rate_limited: u64,
    pub circuit_open: u64,
    pub provider_failed: u64,
    pub fatal: u64,
}

impl DispatchStatsSnapshot {
    pub fn total(&self) -> u64 {
        self.sent
            + self.bypassed
            + self.deduped
            + self.blocked
            + self.no_capacity
            + self.rate_limited
            + self.circuit_open
            + self.provider_failed
            + self.fatal
    }
}

impl DispatcherStats {
    fn record(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Sent => &self.sent,
            DispatchOutcome::Bypass => &self.bypassed,
            DispatchOutcome::Deduped => &self.deduped,
            DispatchOutcome::Blocked(_) => &self.blocked,
            DispatchOutcome::FailedNoCapacity => &self.no_capacity,
            DispatchOutcome::FailedRateLimit => &self.rate_limited,
            DispatchOutcome::FailedCircuitOpen => &self.circuit_open,
            DispatchOutcome::FailedProvider => &self.provider_failed,
            DispatchOutcome::Fatal => &self.fatal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            deduped: self.deduped.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            no_capacity: self.no_capacity.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_open: self.circuit_open.load(Ordering::Relaxed),
            provider_failed: self.provider_failed.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
        }
    }
}

/// Resources a dispatch has taken so far; finalization gives them back
#[derive(Default)]
struct DispatchContext {
    fingerprint: Option<String>,
    dedup_reserved: bool,
    selected: Option<SelectedChip>,
    bypassed: Option<BlockReason>,
    provider_message_id: Option<String>,
    detail: Option<String>,
}

/// Runs outbound messages through the guardrail pipeline
pub struct OutboundDispatcher {
    store: Arc<dyn Store>,
    selector: Arc<ChipSelector>,
    senders: Arc<SenderRegistry>,
    breaker: Arc<CircuitBreaker>,
    guardrails: Arc<dyn GuardrailPolicy>,
    allowlist: Allowlist,
    dedup: DedupWindow,
    clock: Arc<dyn Clock>,
    stats: DispatcherStats,
}

impl OutboundDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        selector: Arc<ChipSelector>,
        senders: Arc<SenderRegistry>,
        breaker: Arc<CircuitBreaker>,
        guardrails: Arc<dyn GuardrailPolicy>,
        reservoir: Arc<dyn RateReservoir>,
        allowlist: Allowlist,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            selector,
            senders,
            breaker,
            guardrails,
            allowlist,
            dedup: DedupWindow::new(reservoir, config.dedup_window),
            clock,
            stats: DispatcherStats::default(),
        }
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Dispatch one message. Always returns a terminal outcome.
    ///
    /// The destination is normalized once up front; every stage, the sender
    /// and the persisted rows see only the normalized form.
    pub async fn dispatch(&self, message: &OutboundMessage) -> DispatchReport {
        let mut normalized = message.clone();
        normalized.destination = normalize_destination(&message.destination);
        let message = &normalized;

        let mut ctx = DispatchContext::default();
        let outcome = match self.run_stages(message, &mut ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    request_id = %message.request_id,
                    error = %e,
                    "Dispatch failed on infrastructure error"
                );
                ctx.detail = Some(e.to_string());
                DispatchOutcome::Fatal
            }
        };
        self.finalize(message, outcome, ctx).await
    }

    async fn run_stages(
        &self,
        message: &OutboundMessage,
        ctx: &mut DispatchContext,
    ) -> Result<DispatchOutcome> {
        if message.destination.is_empty() {
            return Err(DispatchError::BadRequest("destination has no digits".into()));
        }

        if !self.allowlist.permits(&message.destination) {
            debug!(
                request_id = %message.request_id,
                environment = %self.allowlist.environment(),
                "Destination not on allowlist"
            );
            return Ok(DispatchOutcome::Blocked(BlockReason::Allowlist));
        }

        let fp = fingerprint(&message.destination, &message.payload);
        ctx.fingerprint = Some(fp.clone());
        if !self.dedup.reserve(&fp).await? {
            return Ok(DispatchOutcome::Deduped);
        }
        ctx.dedup_reserved = true;

        let now = self.clock.now();
        let denials = self.guardrails.evaluate(message, now).await?;
        if let Some(first) = denials.first().copied() {
            let overridable =
                message.human_authorized && denials.iter().all(BlockReason::is_bypassable);
            if !overridable {
                let reason = denials
                    .iter()
                    .copied()
                    .find(|r| !r.is_bypassable())
                    .unwrap_or(first);
                return Ok(DispatchOutcome::Blocked(reason));
            }
            info!(
                request_id = %message.request_id,
                reason = first.code(),
                "Guardrail overridden by human authorization"
            );
            ctx.bypassed = Some(first);
        }

        let mut request =
            SelectionRequest::new(message.message_type).destination(&message.destination);
        if let Some(conversation_id) = &message.conversation_id {
            request = request.conversation(conversation_id);
        }
        let selection = self.selector.select_chip_with_reservation(&request).await?;
        let Some(selected) = selection.into_selected() else {
            return Ok(DispatchOutcome::FailedNoCapacity);
        };
        let chip = selected.chip.clone();
        ctx.selected = Some(selected);

        let sender = match self.senders.sender_for(&chip) {
            Ok(sender) => sender,
            Err(e) => {
                warn!(chip_id = %chip.id, error = %e, "No sender for chip");
                ctx.detail = Some(e.to_string());
                return Ok(e.outcome());
            }
        };

        if !self.breaker.allow_request(&chip.id) {
            return Ok(DispatchOutcome::FailedCircuitOpen);
        }

        let result = match &message.payload {
            MessagePayload::Text { body } => sender.send_text(&message.destination, body).await,
            MessagePayload::Media { url, caption, kind } => {
                sender
                    .send_media(&message.destination, url, caption.as_deref(), *kind)
                    .await
            }
        };

        match result {
            Ok(receipt) => {
                self.breaker.record_success(&chip.id);
                ctx.provider_message_id = Some(receipt.message_id);
                Ok(if ctx.bypassed.is_some() {
                    DispatchOutcome::Bypass
                } else {
                    DispatchOutcome::Sent
                })
            }
            Err(e) => {
                self.record_send_failure(&chip.id, &e).await;
                ctx.detail = Some(e.to_string());
                Ok(e.outcome())
            }
        }
    }

    async fn record_send_failure(&self, chip_id: &str, err: &SenderError) {
        let now = self.clock.now();
        warn!(chip_id = %chip_id, error = %err, "Send failed");

        if let SenderError::RateLimited { retry_after_secs } = err {
            // Throttling is not a chip fault; park the chip instead
            self.breaker.release_probe(chip_id);
            let wait = retry_after_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_THROTTLE_COOLDOWN);
            if let Err(e) = self
                .store
                .set_chip_cooldown(chip_id, Some(now + to_chrono(wait)), now)
                .await
            {
                warn!(chip_id = %chip_id, error = %e, "Failed to set chip cooldown");
            }
            return;
        }

        self.breaker.record_failure(chip_id);
        if let Err(e) = self.store.record_chip_error(chip_id, now).await {
            warn!(chip_id = %chip_id, error = %e, "Failed to record chip error");
        }
        if matches!(err, SenderError::Disconnected(_)) {
            if let Err(e) = self.store.set_chip_connected(chip_id, false, now).await {
                warn!(chip_id = %chip_id, error = %e, "Failed to mark chip disconnected");
            }
        }
    }

    async fn finalize(
        &self,
        message: &OutboundMessage,
        outcome: DispatchOutcome,
        ctx: DispatchContext,
    ) -> DispatchReport {
        let now = self.clock.now();
        let chip_id = ctx.selected.as_ref().map(|s| s.chip.id.clone());

        if outcome.is_delivered() {
            if let Some(chip_id) = &chip_id {
                self.record_delivery(message, chip_id, now).await;
            }
        } else {
            if ctx.dedup_reserved {
                if let Some(fp) = &ctx.fingerprint {
                    if let Err(e) = self.dedup.release(fp).await {
                        warn!(request_id = %message.request_id, error = %e, "Failed to release dedup reservation");
                    }
                }
            }
            if let Some(reservation) = ctx.selected.as_ref().and_then(|s| s.reservation.as_ref())
            {
                if let Err(e) = self.selector.release_reservation(reservation).await {
                    warn!(key = %reservation.key, error = %e, "Failed to release rate reservation");
                }
            }
        }

        let record = DispatchRecord {
            id: Uuid::new_v4(),
            request_id: message.request_id,
            destination: message.destination.clone(),
            message_type: message.message_type,
            campaign_id: message.campaign_id.clone(),
            chip_id: chip_id.clone(),
            outcome,
            reason_code: outcome.reason_code().to_string(),
            detail: ctx.detail.clone(),
            provider_message_id: ctx.provider_message_id.clone(),
            fingerprint: ctx.fingerprint.clone(),
            bypassed: ctx.bypassed,
            created_at: now,
        };
        if let Err(e) = self.store.record_dispatch(record).await {
            error!(request_id = %message.request_id, error = %e, "Failed to persist dispatch record");
        }
        self.stats.record(outcome);

        if outcome.is_delivered() {
            info!(
                request_id = %message.request_id,
                chip_id = ?chip_id,
                outcome = %outcome,
                "Message dispatched"
            );
        } else {
            debug!(
                request_id = %message.request_id,
                chip_id = ?chip_id,
                outcome = %outcome,
                "Message not dispatched"
            );
        }

        DispatchReport {
            request_id: message.request_id,
            outcome,
            reason_code: outcome.reason_code().to_string(),
            chip_id,
            provider_message_id: ctx.provider_message_id,
            fingerprint: ctx.fingerprint,
            bypassed: ctx.bypassed,
            detail: ctx.detail,
        }
    }

    /// Delivery side effects, stamped with the dispatch record's time
    async fn record_delivery(
        &self,
        message: &OutboundMessage,
        chip_id: &str,
        now: DateTime<Utc>,
    ) {
        let touch = TouchState {
            recipient: message.destination.clone(),
            last_touch_at: now,
            method: message.message_type,
            campaign_id: message.campaign_id.clone(),
            chip_id: Some(chip_id.to_string()),
        };
        if let Err(e) = self.store.advance_touch_state(touch).await {
            warn!(request_id = %message.request_id, error = %e, "Failed to advance touch state");
        }

        let contact = ContactRecord {
            destination: message.destination.clone(),
            chip_id: chip_id.to_string(),
            contacted_at: now,
        };
        if let Err(e) = self.store.record_contact(contact).await {
            warn!(request_id = %message.request_id, error = %e, "Failed to record contact");
        }

        if let Err(e) = self.store.record_chip_send(chip_id, now).await {
            warn!(chip_id = %chip_id, error = %e, "Failed to count chip send");
        }

        if let Some(conversation_id) = &message.conversation_id {
            let bound = match self.store.conversation_binding(conversation_id).await {
                Ok(binding) => binding.is_some_and(|b| b.active && b.chip_id == chip_id),
                Err(e) => {
                    warn!(conversation_id = %conversation_id, error = %e, "Failed to read binding");
                    true
                }
            };
            if !bound {
                let binding = ConversationBinding::new(conversation_id, chip_id, now);
                if let Err(e) = self.store.bind_conversation(binding).await {
                    warn!(conversation_id = %conversation_id, error = %e, "Failed to bind conversation");
                }
            }
        }
    }
}
