//! Stored messages as the server returns them, and how a client shows them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row of the platform's message table. `content` is either legacy
/// plaintext or an envelope string, as marked by `is_e2ee`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(default)]
    pub is_e2ee: bool,
    pub sent_at: DateTime<Utc>,
}

/// What a conversation view shows for one stored message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum DisplayBody {
    /// Message written before E2EE was enabled; shown as is.
    Plaintext(String),
    Decrypted(String),
    /// Our own outgoing envelope. Send keys are gone once used, so the
    /// local copy (if any) lives outside this crate.
    SentEncrypted,
    /// Tampered, corrupted or from a session we no longer have.
    Undecryptable(String),
}

impl DisplayBody {
    pub const UNABLE_TO_DECRYPT: &'static str = "unable to decrypt";

    pub fn text(&self) -> &str {
        match self {
            Self::Plaintext(t) | Self::Decrypted(t) => t,
            Self::SentEncrypted => "encrypted message",
            Self::Undecryptable(_) => Self::UNABLE_TO_DECRYPT,
        }
    }
}
