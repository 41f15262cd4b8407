//! Recipient-facing schemas: touch state, contact history, bindings, opt-outs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::chip::{ChipId, MessageType};

/// Canonical key for a phone-like destination: its digits only.
///
/// Every recipient-keyed row (opt-outs, touch state, contact history) is
/// stored and looked up under this key.
pub fn normalize_destination(destination: &str) -> String {
    destination.chars().filter(char::is_ascii_digit).collect()
}

/// Last outbound contact to a recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchState {
    pub recipient: String,
    /// Never moves backwards
    pub last_touch_at: DateTime<Utc>,
    pub method: MessageType,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub chip_id: Option<ChipId>,
}

/// Result of a compare-and-set touch update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchAdvance {
    /// No state existed or the candidate was newer; state written
    Advanced,
    /// Stored state is newer; nothing written
    AlreadyNewer,
    /// Stored state has the same timestamp; nothing written
    Unchanged,
}

/// One outbound contact from a chip to a destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub destination: String,
    pub chip_id: ChipId,
    pub contacted_at: DateTime<Utc>,
}

/// Conversation pinned to the chip that carries it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationBinding {
    pub conversation_id: String,
    pub chip_id: ChipId,
    pub active: bool,
    pub bound_at: DateTime<Utc>,
}

impl ConversationBinding {
    pub fn new(
        conversation_id: impl Into<String>,
        chip_id: impl Into<ChipId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            chip_id: chip_id.into(),
            active: true,
            bound_at: now,
        }
    }
}

/// Recipient opted out of outbound messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptOut {
    pub destination: String,
    pub opted_out_at: DateTime<Utc>,
}
