//! Content dedup window

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use super::allowlist::normalize_destination;
use super::MessagePayload;
use crate::coordination::RateReservoir;
use crate::types::Result;

fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable fingerprint of destination plus normalized content
pub fn fingerprint(destination: &str, payload: &MessagePayload) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_destination(destination).as_bytes());
    hasher.update(b"\n");
    match payload {
        MessagePayload::Text { body } => {
            hasher.update(b"text\n");
            hasher.update(normalize_text(body).as_bytes());
        }
        MessagePayload::Media { url, caption, kind } => {
            hasher.update(format!("media:{:?}\n", kind).as_bytes());
            hasher.update(url.trim().as_bytes());
            hasher.update(b"\n");
            hasher.update(normalize_text(caption.as_deref().unwrap_or("")).as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

/// Reserves fingerprints for a time window through the shared reservoir
pub struct DedupWindow {
    reservoir: Arc<dyn RateReservoir>,
    window: Duration,
}

impl DedupWindow {
    pub fn new(reservoir: Arc<dyn RateReservoir>, window: Duration) -> Self {
        Self { reservoir, window }
    }

    fn key(fingerprint: &str) -> String {
        format!("dedup:{}", fingerprint)
    }

    /// True if this call took the fingerprint; false if it is a duplicate
    pub async fn reserve(&self, fingerprint: &str) -> Result<bool> {
        let key = Self::key(fingerprint);
        let count = self.reservoir.increment(&key, self.window).await?;
        if count > 1 {
            self.reservoir.decrement(&key).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Free a fingerprint whose send did not happen
    pub async fn release(&self, fingerprint: &str) -> Result<()> {
        self.reservoir.remove(&Self::key(fingerprint)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::coordination::InMemoryReservoir;

    fn text(body: &str) -> MessagePayload {
        MessagePayload::Text {
            body: body.to_string(),
        }
    }

    #[test]
    fn test_fingerprint_normalizes() {
        assert_eq!(
            fingerprint("+1 555 0001", &text("Hello   there")),
            fingerprint("15550001", &text("hello there "))
        );
        assert_ne!(
            fingerprint("15550001", &text("hello")),
            fingerprint("15550002", &text("hello"))
        );
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let window = DedupWindow::new(
            Arc::new(InMemoryReservoir::new(Arc::new(SystemClock))),
            Duration::from_secs(600),
        );
        let fp = fingerprint("15550001", &text("hi"));
        assert!(window.reserve(&fp).await.unwrap());
        assert!(!window.reserve(&fp).await.unwrap());
        window.release(&fp).await.unwrap();
        assert!(window.reserve(&fp).await.unwrap());
    }
}
