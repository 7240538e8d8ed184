//! Wire contract for the realtime gateway.
//!
//! Every server-to-client frame is a JSON envelope `{"event": ..., "data": ...}`.
//! `presence.update` carries the full online set (never a delta); clients
//! replace their local mirror wholesale on each delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Application close codes (4000-range)
// ---------------------------------------------------------------------------

pub mod close_code {
    /// A newer connection for the same user replaced this one.
    pub const SUPERSEDED: u16 = 4008;
    /// No Pong arrived within the heartbeat timeout.
    pub const HEARTBEAT_TIMEOUT: u16 = 4009;
}

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub mod event {
    pub const PRESENCE_UPDATE: &str = "presence.update";
    pub const NEW_MESSAGE: &str = "newMessage";
}

// ---------------------------------------------------------------------------
// Server → client events
// ---------------------------------------------------------------------------

/// An event pushed from the server to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Full replacement set of currently online user IDs.
    #[serde(rename = "presence.update")]
    PresenceUpdate(Vec<String>),
    /// A direct message, delivered only to the recipient's connection.
    #[serde(rename = "newMessage")]
    NewMessage(DirectMessage),
}

/// A direct message between two users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// `msg_` prefixed ULID.
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
