//! Channel Protocol Types
//!
//! Events exchanged over the push channel. Every frame is a JSON text frame
//! of the form `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Events sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage {
        conversation_id: String,
        content: String,
    },
}

/// Events sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A persisted message: either the echo of a user send or an assistant reply.
    MessageReceived(Message),
    TypingIndicator {
        #[serde(alias = "conversationId")]
        conversation_id: String,
        #[serde(alias = "isTyping")]
        is_typing: bool,
    },
    Error { message: String },
}

/// Named inbound channels a consumer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageReceived,
    TypingIndicator,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::MessageReceived,
        EventKind::TypingIndicator,
        EventKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageReceived => "message_received",
            EventKind::TypingIndicator => "typing_indicator",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::MessageReceived(_) => EventKind::MessageReceived,
            ServerEvent::TypingIndicator { .. } => EventKind::TypingIndicator,
            ServerEvent::Error { .. } => EventKind::Error,
        }
    }
}

impl ClientEvent {
    pub fn send_message(conversation_id: &str, content: &str) -> Self {
        ClientEvent::SendMessage {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage { .. } => "send_message",
        }
    }
}
