//! Core types: merged-timeline messages, connection status, endpoints,
//! and the client error enum.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What kind of entry a [`Message`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A chat message relayed by a server.
    Chat,
    /// Client-generated notices (connects, disconnects, diagnostics) and
    /// raw frames the client did not understand.
    System,
}

/// One entry in the merged message timeline.  Immutable once appended.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Dedup key.  Unique within the log.
    pub id: String,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Name of the connection this message arrived on.
    pub source_connection: String,
    /// Label of the endpoint that connection is assigned to.
    pub source_endpoint: String,
}

/// Caller-facing status of a named connection.
///
/// `Reconnecting` and `Error` both mean a reconnect is pending; they differ
/// in what triggered it (abnormal close vs. transport/construction error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Error,
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Errors surfaced to the caller of the supervisor API.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("no connection named `{0}`")]
    UnknownConnection(String),

    #[error("connection `{name}` is not open (status: {status})")]
    NotOpen {
        name: String,
        status: ConnectionStatus,
    },

    #[error("config: {0}")]
    Config(String),

    #[error("send failed: {0}")]
    Send(String),
}

/// One entry of the endpoint pool.
///
/// `label` is the short form used in status lines and system messages
/// (`":8080"` for a localhost pool entry).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub label: String,
}

impl Endpoint {
    /// Build an endpoint from a base WebSocket URL, deriving the label
    /// from its port.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let label = derive_label(&url);
        Self { url, label }
    }

    /// Full connection URL for a named connection, carrying the identity
    /// token as a query parameter: `ws://host:port/ws?token=user:<name>`.
    pub fn connection_url(&self, name: &str) -> String {
        let sep = if self.url.contains('?') { "&" } else { "?" };
        format!("{}{}token=user:{}", self.url, sep, name)
    }
}

fn derive_label(url: &str) -> String {
    let authority = url
        .trim_start_matches("ws://")
        .trim_start_matches("wss://");
    let authority = authority.split('/').next().unwrap_or(authority);
    match authority.rsplit_once(':') {
        Some((_, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            format!(":{port}")
        }
        _ => authority.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_url_appends_token() {
        let ep = Endpoint::new("ws://localhost:8080/ws");
        assert_eq!(
            ep.connection_url("alice"),
            "ws://localhost:8080/ws?token=user:alice"
        );
    }

    #[test]
    fn connection_url_with_existing_query_params() {
        let ep = Endpoint::new("ws://localhost:8080/ws?foo=bar");
        assert_eq!(
            ep.connection_url("alice"),
            "ws://localhost:8080/ws?foo=bar&token=user:alice"
        );
    }

    #[test]
    fn label_is_port_when_present() {
        assert_eq!(Endpoint::new("ws://localhost:8081/ws").label, ":8081");
        assert_eq!(Endpoint::new("ws://127.0.0.1:43211/ws").label, ":43211");
    }

    #[test]
    fn label_falls_back_to_host() {
        assert_eq!(Endpoint::new("wss://chat.example.com/ws").label, "chat.example.com");
    }

    #[test]
    fn status_display_is_lowercase() {
        assert_eq!(ConnectionStatus::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionStatus::Open.to_string(), "open");
    }
}
