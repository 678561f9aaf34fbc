//! Chat wire protocol: outbound control/chat frames and inbound frame
//! classification.
//!
//! The server speaks JSON in both directions.  Outbound frames carry an
//! `action` discriminant (`join`, `leave`, `message`); inbound frames carry
//! a `type` field, of which only `chat` is promoted to a structured
//! [`ChatFrame`].  Everything else that parses as JSON is handed back as
//! [`ServerFrame::Unrecognized`] so the caller can surface it instead of
//! dropping it.  Bytes that fail to parse produce a [`DecodeError`] that
//! keeps the raw payload for diagnostics — decoding never panics.

use serde::{Deserialize, Serialize};

/// Outbound frame envelope.  `action` is the wire discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Client → Server: enter a room.
    Join { room: String },

    /// Client → Server: leave a room (sent before a graceful close).
    Leave { room: String },

    /// Client → Server: a chat message for a room.
    Message {
        room: String,
        #[serde(rename = "type")]
        kind: String,
        payload: ChatBody,
        /// Client-generated correlation id, echoed by the server.
        client_id: String,
    },
}

impl ClientFrame {
    pub fn join(room: impl Into<String>) -> Self {
        Self::Join { room: room.into() }
    }

    pub fn leave(room: impl Into<String>) -> Self {
        Self::Leave { room: room.into() }
    }

    /// Build a chat message frame.  The `type` field is always `"chat"`.
    pub fn chat(
        room: impl Into<String>,
        user: impl Into<String>,
        text: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self::Message {
            room: room.into(),
            kind: "chat".into(),
            payload: ChatBody {
                text: text.into(),
                user: user.into(),
            },
            client_id: client_id.into(),
        }
    }
}

/// The `payload` object of a chat message frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatBody {
    pub text: String,
    pub user: String,
}

/// Which inbound `type` values are promoted to [`ChatFrame`]s.
///
/// The multi-connection client accepts only `chat`.  The legacy
/// single-connection client also accepted `user`, so that mode is kept as
/// an explicit decode variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatTypes {
    #[default]
    ChatOnly,
    ChatOrUser,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// A `{type:"chat"}` frame with its payload pulled apart.
    Chat(ChatFrame),
    /// Well-formed JSON the client does not understand.  Surfaced to the
    /// caller as a raw system message, never dropped.
    Unrecognized(serde_json::Value),
}

/// A decoded chat frame.
///
/// `message_id` and `created_at` are server-assigned and optional;
/// `created_at` is kept as the server's RFC 3339 string because it also
/// participates verbatim in the dedup key.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatFrame {
    pub sender: String,
    pub text: String,
    pub message_id: Option<String>,
    pub created_at: Option<String>,
}

/// Inbound payload was not valid JSON.  Carries the raw bytes so the
/// caller can surface them in a diagnostic message.
#[derive(thiserror::Error, Debug)]
#[error("invalid frame: {source}")]
pub struct DecodeError {
    pub raw: String,
    #[source]
    pub source: serde_json::Error,
}

/// Decode an inbound frame in multi-connection mode (`chat` only).
pub fn decode(raw: &str) -> Result<ServerFrame, DecodeError> {
    decode_with(raw, ChatTypes::ChatOnly)
}

/// Decode an inbound frame, promoting the `type` values selected by
/// `accept` to [`ChatFrame`]s.
pub fn decode_with(raw: &str, accept: ChatTypes) -> Result<ServerFrame, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|source| DecodeError {
        raw: raw.to_string(),
        source,
    })?;

    let kind = value.get("type").and_then(|t| t.as_str());
    let is_chat = matches!(kind, Some("chat"))
        || (accept == ChatTypes::ChatOrUser && matches!(kind, Some("user")));
    if !is_chat {
        return Ok(ServerFrame::Unrecognized(value));
    }

    let payload = value.get("payload");
    let sender = payload
        .and_then(|p| p.get("user"))
        .and_then(|u| u.as_str())
        .unwrap_or("Unknown")
        .to_string();
    let text = payload
        .and_then(|p| p.get("text"))
        .and_then(|t| t.as_str())
        .unwrap_or("Empty message")
        .to_string();
    // An empty message_id counts as absent so the dedup key falls back to
    // content-derived fields.
    let message_id = value
        .get("message_id")
        .and_then(|m| m.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let created_at = value
        .get("created_at")
        .and_then(|c| c.as_str())
        .map(str::to_string);

    Ok(ServerFrame::Chat(ChatFrame {
        sender,
        text,
        message_id,
        created_at,
    }))
}
