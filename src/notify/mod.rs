//! Best-effort alert notification
//!
//! Notifiers never sit on the critical path: callers go through
//! [`notify_best_effort`], which bounds the wait and only logs failures.

pub mod webhook;

pub use webhook::{WebhookNotifier, WebhookNotifierConfig};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::db::schemas::Severity;
use crate::types::Result;

/// Default bound on a single notification attempt
pub const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Message sent to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub severity: Severity,
    pub lines: Vec<String>,
    #[serde(default)]
    pub chip_id: Option<String>,
}

impl Notification {
    pub fn new(title: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            severity,
            lines: Vec::new(),
            chip_id: None,
        }
    }

    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    pub fn for_chip(mut self, chip_id: impl Into<String>) -> Self {
        self.chip_id = Some(chip_id.into());
        self
    }
}

/// Alert sink
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, n: &Notification) -> Result<()> {
        let body = n.lines.join("; ");
        match n.severity {
            Severity::Critical => error!(title = %n.title, chip_id = ?n.chip_id, "{}", body),
            Severity::Warning => warn!(title = %n.title, chip_id = ?n.chip_id, "{}", body),
            Severity::Info => info!(title = %n.title, chip_id = ?n.chip_id, "{}", body),
        }
        Ok(())
    }
}

/// Keeps notifications in memory; used by tests and dry runs
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, n: &Notification) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(n.clone());
        Ok(())
    }
}

/// Deliver a notification, swallowing failures and timeouts
pub async fn notify_best_effort(notifier: &dyn Notifier, notification: Notification) {
    match tokio::time::timeout(NOTIFY_TIMEOUT, notifier.notify(&notification)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(title = %notification.title, error = %e, "Notification failed"),
        Err(_) => warn!(
            title = %notification.title,
            timeout_secs = NOTIFY_TIMEOUT.as_secs(),
            "Notification timed out"
        ),
    }
}
