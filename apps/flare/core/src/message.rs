//! Chat message shapes. Field names on the wire match the ones the browser
//! client already speaks (`username`, `message`, `user-id`, `ip`, `is_sos`),
//! and the same JSON is what gets persisted.

use std::net::SocketAddr;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::Identity;

/// `YYYY-MM-DD HH:MM:SS`, second resolution, no zone.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A relayed chat record. Immutable once stamped by the receiving session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "username")]
    pub sender: String,
    #[serde(rename = "message", default)]
    pub body: String,
    #[serde(rename = "user-id", default)]
    pub origin_tag: String,
    pub timestamp: String,
    #[serde(rename = "ip", default)]
    pub origin_address: String,
    #[serde(rename = "is_sos", default)]
    pub is_priority: bool,
}

/// What a client sends over the socket. Anything the server stamps itself is
/// ignored even when present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub is_sos: bool,
}

impl InboundFrame {
    pub fn ordinary(body: impl Into<String>) -> Self {
        Self {
            message: body.into(),
            is_sos: false,
        }
    }

    pub fn distress(body: impl Into<String>) -> Self {
        Self {
            message: body.into(),
            is_sos: true,
        }
    }

    /// Turns the frame into a record attributed to `sender`. The priority flag
    /// is taken from the client as-is.
    pub fn stamp(
        self,
        sender: &Identity,
        origin_tag: impl Into<String>,
        origin_address: Option<SocketAddr>,
        timestamp: String,
    ) -> ChatMessage {
        ChatMessage {
            sender: sender.as_str().to_string(),
            body: self.message,
            origin_tag: origin_tag.into(),
            timestamp,
            origin_address: origin_address
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
            is_priority: self.is_sos,
        }
    }
}

pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Current process-local wall clock time in [`TIMESTAMP_FORMAT`].
pub fn now_timestamp() -> String {
    format_timestamp(Local::now().naive_local())
}
