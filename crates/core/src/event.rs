//! Normalized inbound chat events.
//!
//! Raw frames from the chat service are decoded by the connection layer
//! into [`InboundEvent`]s and handed to the fan-out bus. Once built an
//! event is never mutated.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::types::{AccountId, Timestamp};

/// Coarse classification of a decoded push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A buyer chat message.
    Message,
    /// A trade status change (paid, closed, awaiting shipment, ...).
    Order,
    /// Anything else the service pushes (typing indicators, system notices).
    Notification,
}

/// A decoded event received on one account's connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub account_id: AccountId,
    pub kind: EventKind,
    /// Conversation id, when the push belongs to a chat.
    pub conversation_id: Option<String>,
    /// Sending user id, when known.
    pub sender_id: Option<String>,
    /// Human-readable text (message body or reminder), when present.
    pub text: Option<String>,
    /// The decoded push body as received.
    pub payload: serde_json::Value,
    pub received_at: Timestamp,
}

impl InboundEvent {
    pub fn new(account_id: impl Into<AccountId>, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            account_id: account_id.into(),
            kind,
            conversation_id: None,
            sender_id: None,
            text: None,
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}
