//! Scriptable sender for tests

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::{ConnectionStatus, MediaKind, SendReceipt, Sender, SenderError, SenderFactory};
use crate::db::schemas::{Chip, ProviderKind};

/// Mock sender.
///
/// Succeeds by default with sequential message ids; queued failures are
/// returned first, one per send.
pub struct MockSender {
    provider: ProviderKind,
    connected: AtomicBool,
    failures: Mutex<VecDeque<SenderError>>,
    call_count: AtomicU32,
    sent: Mutex<Vec<String>>,
}

impl MockSender {
    pub fn new() -> Self {
        Self {
            provider: ProviderKind::CloudApi,
            connected: AtomicBool::new(true),
            failures: Mutex::new(VecDeque::new()),
            call_count: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = provider;
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Queue an error for the next send
    pub fn fail_next(&self, error: SenderError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    /// Number of send attempts (successful or not)
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Destinations of successful sends, in order
    pub fn sent_to(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn attempt(&self, destination: &str) -> Result<SendReceipt, SenderError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(error);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SenderError::Disconnected("mock session closed".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(destination.to_string());
        Ok(SendReceipt {
            message_id: format!("mock-{}", n),
        })
    }
}

impl Default for MockSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sender for MockSender {
    fn provider(&self) -> ProviderKind {
        self.provider
    }

    async fn send_text(&self, destination: &str, _body: &str) -> Result<SendReceipt, SenderError> {
        self.attempt(destination)
    }

    async fn send_media(
        &self,
        destination: &str,
        _url: &str,
        _caption: Option<&str>,
        _kind: MediaKind,
    ) -> Result<SendReceipt, SenderError> {
        self.attempt(destination)
    }

    async fn status(&self) -> Result<ConnectionStatus, SenderError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(ConnectionStatus::connected())
        } else {
            Ok(ConnectionStatus::disconnected("closed"))
        }
    }
}

/// Hands out one shared [`MockSender`] for every chip
pub struct MockSenderFactory {
    provider: ProviderKind,
    sender: Arc<MockSender>,
}

impl MockSenderFactory {
    pub fn new(provider: ProviderKind, sender: Arc<MockSender>) -> Self {
        Self { provider, sender }
    }
}

impl SenderFactory for MockSenderFactory {
    fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn create(&self, _chip: &Chip) -> Result<Arc<dyn Sender>, SenderError> {
        Ok(self.sender.clone())
    }
}
