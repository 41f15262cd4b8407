//! Outbound dispatcher integration tests
//!
//! Drives every stage of the dispatch pipeline and checks that each terminal
//! outcome is finalized exactly once:
//! - one persisted dispatch record per request
//! - delivery side effects only for delivered messages
//! - dedup and rate reservations returned for everything else

mod common;

use chrono::Duration;

use chip_dispatch::coordination::RateReservoir;
use chip_dispatch::db::schemas::{
    hour_bucket_label, BlockReason, ChipStatus, DispatchOutcome, MessageType, TouchState,
};
use chip_dispatch::db::Store;
use chip_dispatch::Clock;
use chip_dispatch::dispatch::{
    fingerprint, Allowlist, DispatchReport, Environment, GuardrailConfig, MessagePayload,
    OutboundDispatcher, OutboundMessage,
};
use chip_dispatch::selector::reservation_key;
use chip_dispatch::sender::{MediaKind, SenderError};
use common::{production, start_time, Harness};

const DEST: &str = "+15550100";

async fn dispatch_once(
    h: &Harness,
    dispatcher: &OutboundDispatcher,
    message: &OutboundMessage,
) -> DispatchReport {
    let report = dispatcher.dispatch(message).await;
    let records = h.store.dispatch_records(message.request_id).await.unwrap();
    assert_eq!(records.len(), 1, "finalize must run exactly once");
    assert_eq!(records[0].outcome, report.outcome);
    assert_eq!(records[0].reason_code, report.reason_code);
    report
}

async fn reserved_this_hour(h: &Harness, chip_id: &str) -> u64 {
    let key = reservation_key(chip_id, &hour_bucket_label(h.clock.now()));
    h.reservoir.current(&key).await.unwrap()
}

async fn dedup_held(h: &Harness, message: &OutboundMessage) -> bool {
    let key = format!("dedup:{}", fingerprint(&message.destination, &message.payload));
    h.reservoir.current(&key).await.unwrap() > 0
}

// =============================================================================
// Delivered
// =============================================================================

#[tokio::test]
async fn test_sent_message_records_delivery() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    let dispatcher = h.dispatcher(production());

    let message = OutboundMessage::text(DEST, MessageType::Followup, "Checking in")
        .conversation("conv-1")
        .campaign("spring");
    let report = dispatch_once(&h, &dispatcher, &message).await;

    assert_eq!(report.outcome, DispatchOutcome::Sent);
    assert_eq!(report.reason_code, "SENT");
    assert_eq!(report.chip_id.as_deref(), Some("chip-a"));
    assert_eq!(report.provider_message_id.as_deref(), Some("mock-1"));

    let touch = h.store.touch_state(DEST).await.unwrap().unwrap();
    assert_eq!(touch.last_touch_at, start_time());
    assert_eq!(touch.campaign_id.as_deref(), Some("spring"));
    assert_eq!(h.store.contact_history(DEST).await.unwrap().len(), 1);

    let chip = h.chip("chip-a").await;
    assert_eq!(chip.rolling_sent, 1);
    assert_eq!(chip.counters.hourly_at(start_time()), 1);
    assert_eq!(reserved_this_hour(&h, "chip-a").await, 1);
    assert!(dedup_held(&h, &message).await);

    let binding = h.store.conversation_binding("conv-1").await.unwrap().unwrap();
    assert_eq!(binding.chip_id, "chip-a");
    assert_eq!(dispatcher.stats().sent, 1);
}

#[tokio::test]
async fn test_media_message_is_sent() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    let dispatcher = h.dispatcher(production());

    let message = OutboundMessage::new(
        DEST,
        MessageType::Reply,
        MessagePayload::Media {
            url: "https://cdn.example.com/brochure.pdf".into(),
            caption: Some("Brochure".into()),
            kind: MediaKind::Document,
        },
    );
    let report = dispatch_once(&h, &dispatcher, &message).await;
    assert_eq!(report.outcome, DispatchOutcome::Sent);
    assert_eq!(h.sender.sent_to(), vec!["15550100".to_string()]);
}

// =============================================================================
// Allowlist and dedup
// =============================================================================

#[tokio::test]
async fn test_allowlist_fails_closed_outside_production() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    let dispatcher = h.dispatcher(Allowlist::new(Environment::Staging, ["+1 555 0100"]));

    let allowed = OutboundMessage::text(DEST, MessageType::Followup, "hello");
    assert_eq!(
        dispatch_once(&h, &dispatcher, &allowed).await.outcome,
        DispatchOutcome::Sent
    );

    let other = OutboundMessage::text("+15550999", MessageType::Followup, "hello");
    let report = dispatch_once(&h, &dispatcher, &other).await;
    assert_eq!(report.outcome, DispatchOutcome::Blocked(BlockReason::Allowlist));
    assert_eq!(report.reason_code, "BLOCKED_ALLOWLIST");
    assert!(report.chip_id.is_none());
    assert_eq!(h.sender.call_count(), 1);
}

#[tokio::test]
async fn test_identical_content_is_deduped() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    let dispatcher = h.dispatcher(production());

    let first = OutboundMessage::text(DEST, MessageType::Reply, "See you at 5");
    let second = OutboundMessage::text(DEST, MessageType::Reply, "see you  at 5 ");
    assert_eq!(
        dispatch_once(&h, &dispatcher, &first).await.outcome,
        DispatchOutcome::Sent
    );
    let report = dispatch_once(&h, &dispatcher, &second).await;
    assert_eq!(report.outcome, DispatchOutcome::Deduped);
    assert_eq!(report.reason_code, "DEDUPED");

    // The duplicate must not free the original's fingerprint
    assert!(dedup_held(&h, &first).await);
    assert_eq!(h.sender.call_count(), 1);
}

// =============================================================================
// Guardrails
// =============================================================================

#[tokio::test]
async fn test_opt_out_blocks_and_releases_dedup() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    h.store.record_opt_out(DEST, start_time()).await.unwrap();
    let dispatcher = h.dispatcher(production());

    let message = OutboundMessage::text(DEST, MessageType::Reply, "hello").human_authorized();
    let report = dispatch_once(&h, &dispatcher, &message).await;

    assert_eq!(report.outcome, DispatchOutcome::Blocked(BlockReason::OptOut));
    assert!(!dedup_held(&h, &message).await);
    assert_eq!(h.sender.call_count(), 0);
}

#[tokio::test]
async fn test_opt_out_holds_across_destination_formats() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    h.store.record_opt_out(DEST, start_time()).await.unwrap();
    let dispatcher = h.dispatcher(production());

    for written in ["+1 555 0100", "1-555-0100", "(1) 555.0100"] {
        let message = OutboundMessage::text(written, MessageType::Followup, written);
        let report = dispatch_once(&h, &dispatcher, &message).await;
        assert_eq!(
            report.outcome,
            DispatchOutcome::Blocked(BlockReason::OptOut),
            "{written}"
        );
    }
    assert_eq!(h.sender.call_count(), 0);
}

#[tokio::test]
async fn test_pacing_keys_on_normalized_destination() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    let dispatcher = h.dispatcher(production());

    let first = OutboundMessage::text("+1 (555) 0100", MessageType::Followup, "Checking in");
    assert_eq!(
        dispatch_once(&h, &dispatcher, &first).await.outcome,
        DispatchOutcome::Sent
    );

    let records = h.store.dispatch_records(first.request_id).await.unwrap();
    assert_eq!(records[0].destination, "15550100");
    assert_eq!(h.store.contact_history("15550100").await.unwrap().len(), 1);
    assert!(h.store.touch_state("+1-555-0100").await.unwrap().is_some());

    let second = OutboundMessage::text(DEST, MessageType::Followup, "Following up");
    assert_eq!(
        dispatch_once(&h, &dispatcher, &second).await.outcome,
        DispatchOutcome::Blocked(BlockReason::CoolingOff)
    );
}

#[tokio::test]
async fn test_human_authorization_bypasses_cooling_off() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    h.store
        .advance_touch_state(TouchState {
            recipient: DEST.into(),
            last_touch_at: start_time() - Duration::hours(2),
            method: MessageType::Prospecting,
            campaign_id: None,
            chip_id: Some("chip-a".into()),
        })
        .await
        .unwrap();
    let dispatcher = h.dispatcher(production());

    let automated = OutboundMessage::text(DEST, MessageType::Followup, "Any questions?");
    let report = dispatch_once(&h, &dispatcher, &automated).await;
    assert_eq!(report.outcome, DispatchOutcome::Blocked(BlockReason::CoolingOff));

    let approved = OutboundMessage {
        request_id: uuid::Uuid::new_v4(),
        ..automated.clone()
    }
    .human_authorized();
    let report = dispatch_once(&h, &dispatcher, &approved).await;
    assert_eq!(report.outcome, DispatchOutcome::Bypass);
    assert_eq!(report.reason_code, "BYPASS");
    assert_eq!(report.bypassed, Some(BlockReason::CoolingOff));

    let touch = h.store.touch_state(DEST).await.unwrap().unwrap();
    assert_eq!(touch.last_touch_at, start_time());
}

#[tokio::test]
async fn test_safe_mode_is_not_bypassable_but_spares_replies() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    let dispatcher = h.dispatcher_with_guardrails(
        production(),
        GuardrailConfig {
            safe_mode: true,
            ..GuardrailConfig::default()
        },
    );

    let outreach =
        OutboundMessage::text(DEST, MessageType::Prospecting, "Intro").human_authorized();
    let report = dispatch_once(&h, &dispatcher, &outreach).await;
    assert_eq!(report.outcome, DispatchOutcome::Blocked(BlockReason::SafeMode));

    let reply = OutboundMessage::text(DEST, MessageType::Reply, "Thanks!");
    assert_eq!(
        dispatch_once(&h, &dispatcher, &reply).await.outcome,
        DispatchOutcome::Sent
    );
}

// =============================================================================
// Routing and send failures
// =============================================================================

#[tokio::test]
async fn test_no_capacity_releases_dedup_for_retry() {
    let h = Harness::new();
    let dispatcher = h.dispatcher(production());
    let message = OutboundMessage::text(DEST, MessageType::Followup, "hello");

    let report = dispatch_once(&h, &dispatcher, &message).await;
    assert_eq!(report.outcome, DispatchOutcome::FailedNoCapacity);
    assert!(!dedup_held(&h, &message).await);

    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    let retry = OutboundMessage::text(DEST, MessageType::Followup, "hello");
    assert_eq!(
        dispatch_once(&h, &dispatcher, &retry).await.outcome,
        DispatchOutcome::Sent
    );
}

#[tokio::test]
async fn test_provider_failure_is_classified_and_released() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    h.sender.fail_next(SenderError::Provider("upstream 500".into()));
    let dispatcher = h.dispatcher(production());

    let message = OutboundMessage::text(DEST, MessageType::Followup, "hello");
    let report = dispatch_once(&h, &dispatcher, &message).await;

    assert_eq!(report.outcome, DispatchOutcome::FailedProvider);
    assert_eq!(report.chip_id.as_deref(), Some("chip-a"));
    assert!(report.detail.unwrap().contains("upstream 500"));
    assert_eq!(reserved_this_hour(&h, "chip-a").await, 0);
    assert!(!dedup_held(&h, &message).await);
    assert_eq!(h.breaker.consecutive_failures("chip-a"), 1);
    assert_eq!(h.chip("chip-a").await.rolling_errors, 1);
    assert!(h.store.touch_state(DEST).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rate_limit_parks_chip_without_tripping_breaker() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    h.sender.fail_next(SenderError::RateLimited {
        retry_after_secs: Some(120),
    });
    let dispatcher = h.dispatcher(production());

    let report = dispatch_once(
        &h,
        &dispatcher,
        &OutboundMessage::text(DEST, MessageType::Followup, "hello"),
    )
    .await;
    assert_eq!(report.outcome, DispatchOutcome::FailedRateLimit);
    assert!(report.outcome.is_retryable());
    assert_eq!(h.breaker.consecutive_failures("chip-a"), 0);
    assert_eq!(
        h.chip("chip-a").await.cooldown_until,
        Some(start_time() + Duration::seconds(120))
    );

    let next = OutboundMessage::text("+15550200", MessageType::Followup, "hello");
    assert_eq!(
        dispatch_once(&h, &dispatcher, &next).await.outcome,
        DispatchOutcome::FailedNoCapacity
    );
}

#[tokio::test]
async fn test_exhausted_half_open_probe_fails_circuit_open() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    for _ in 0..h.breaker.config().failure_threshold {
        h.breaker.record_failure("chip-a");
    }
    h.clock.advance(Duration::minutes(5));
    // Another request already holds the only probe slot
    assert!(h.breaker.allow_request("chip-a"));
    let dispatcher = h.dispatcher(production());

    let report = dispatch_once(
        &h,
        &dispatcher,
        &OutboundMessage::text(DEST, MessageType::Followup, "hello"),
    )
    .await;

    assert_eq!(report.outcome, DispatchOutcome::FailedCircuitOpen);
    assert_eq!(report.reason_code, "FAILED_CIRCUIT_OPEN");
    assert_eq!(h.sender.call_count(), 0);
    assert_eq!(reserved_this_hour(&h, "chip-a").await, 0);
}

#[tokio::test]
async fn test_bad_request_is_fatal_and_still_finalized() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    let dispatcher = h.dispatcher(production());

    let report = dispatch_once(
        &h,
        &dispatcher,
        &OutboundMessage::text("  ", MessageType::Followup, "hello"),
    )
    .await;

    assert_eq!(report.outcome, DispatchOutcome::Fatal);
    assert_eq!(report.reason_code, "FATAL");
    assert!(report.detail.is_some());
    assert_eq!(dispatcher.stats().fatal, 1);
}

#[tokio::test]
async fn test_every_dispatch_is_counted_once() {
    let h = Harness::new();
    h.add_chip("chip-a", ChipStatus::Active, 95).await;
    h.store.record_opt_out("+15550300", start_time()).await.unwrap();
    h.sender.fail_next(SenderError::Disconnected("session closed".into()));
    let dispatcher = h.dispatcher(production());

    let messages = [
        OutboundMessage::text(DEST, MessageType::Followup, "one"),
        OutboundMessage::text(DEST, MessageType::Reply, "two"),
        OutboundMessage::text(DEST, MessageType::Reply, "two"),
        OutboundMessage::text("+15550300", MessageType::Reply, "three"),
        OutboundMessage::text("", MessageType::Reply, "four"),
    ];
    for message in &messages {
        dispatch_once(&h, &dispatcher, message).await;
    }

    let stats = dispatcher.stats();
    assert_eq!(stats.total(), messages.len() as u64);
    assert_eq!(h.store.dispatch_count().await, messages.len());
    assert_eq!(stats.provider_failed, 1);
    assert_eq!(stats.deduped, 0);
    assert!(!h.chip("chip-a").await.connected);
}
