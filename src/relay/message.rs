//! Inbound message envelope.

use serde::{Deserialize, Serialize};

/// One inbound message from the chat platform, reduced to the fields
/// the pipeline needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub user_id: i64,
    /// Sender display name, used as the opaque user label for the AI backend.
    pub username: String,
    /// Message text or media caption.
    pub text: String,
    /// True for a one-on-one private chat.
    pub is_private: bool,
    /// Set when the message arrived through a Telegram business connection.
    pub business_connection_id: Option<String>,
}

impl InboundMessage {
    /// An envelope is processable only with a real sender, a real message
    /// id, and non-empty text.
    pub fn is_valid(&self) -> bool {
        self.user_id > 0 && self.message_id > 0 && !self.text.trim().is_empty()
    }
}
