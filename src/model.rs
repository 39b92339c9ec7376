//! Core data model.
//!
//! A message is something a transport hands out for processing. The engine
//! never interprets the body; it only tracks identity, headers and liveness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Message headers. Opaque to the engine, echoed back on heartbeat resets.
pub type Headers = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Newtype for message IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// A message dequeued from a transport and owned by one worker until it is
/// committed or rolled back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub id: MessageId,

    /// Payload. Serialization is the transport's concern.
    pub body: serde_json::Value,

    pub headers: Headers,

    /// When the transport handed this message out.
    pub dequeued_at: DateTime<Utc>,

    /// Heartbeat recorded by the transport at dequeue time, if it tracks liveness.
    pub heartbeat: Option<DateTime<Utc>>,
}

impl ReceivedMessage {
    pub fn new(id: MessageId, body: serde_json::Value) -> Self {
        Self {
            id,
            body,
            headers: Headers::new(),
            dequeued_at: Utc::now(),
            heartbeat: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Result of the most recent liveness update for a message.
///
/// `last_heartbeat` is `None` when the last update found no record (the
/// message was already completed or removed) or failed outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartBeatStatus {
    pub message_id: MessageId,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl HeartBeatStatus {
    pub fn new(message_id: MessageId, last_heartbeat: Option<DateTime<Utc>>) -> Self {
        Self {
            message_id,
            last_heartbeat,
        }
    }
}

/// A message whose heartbeat lapsed, as reported by the heartbeat store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiredHeartBeat {
    pub message_id: MessageId,
    pub headers: Headers,
    pub last_heartbeat: DateTime<Utc>,
}

/// A message returned to claimable state by a reset scan.
///
/// The reset instant is only known to lie somewhere inside the window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetHeartBeatOutput {
    pub message_id: MessageId,
    pub headers: Headers,
    pub approximate_reset_start: DateTime<Utc>,
    pub approximate_reset_end: DateTime<Utc>,
}
