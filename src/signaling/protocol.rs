#![forbid(unsafe_code)]

// Wire protocol - JSON message types exchanged over the WebSocket.
// Signaling payloads (SDP offers/answers, ICE candidates) are carried as
// opaque values and forwarded without inspection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on room identifiers accepted over the wire.
pub const MAX_ROOM_ID_LEN: usize = 128;
/// Upper bound on display names.
pub const MAX_USERNAME_LEN: usize = 64;
/// Upper bound on a single chat message.
pub const MAX_CHAT_LEN: usize = 4096;

/// Client-to-server events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Subscribe to a room and appear on its roster
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        username: String,
    },
    /// Leave a room
    #[serde(rename_all = "camelCase")]
    Leave {
        room_id: String,
        username: String,
    },
    /// Replace the shared buffer (last write wins)
    #[serde(rename_all = "camelCase")]
    CodeChange {
        room_id: String,
        username: String,
        code: String,
    },
    /// Replace the room's language tag
    #[serde(rename_all = "camelCase")]
    LanguageChange {
        room_id: String,
        username: String,
        language: String,
    },
    /// Room-wide chat message
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        room_id: String,
        username: String,
        message: String,
    },
    /// WebRTC session offer; `to` targets one participant by name
    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        room_id: String,
        from: String,
        #[serde(default)]
        to: Option<String>,
        offer: Value,
    },
    /// WebRTC session answer
    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        room_id: String,
        from: String,
        #[serde(default)]
        to: Option<String>,
        answer: Value,
    },
    /// WebRTC ICE candidate
    #[serde(rename_all = "camelCase")]
    WebrtcIce {
        room_id: String,
        from: String,
        #[serde(default)]
        to: Option<String>,
        candidate: Value,
    },
}

/// Server-to-client events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Room snapshot sent to a joining connection only
    #[serde(rename_all = "camelCase")]
    InitialState {
        code: String,
        language: String,
        participants: Vec<String>,
    },
    /// Another participant joined
    UserJoined {
        username: String,
    },
    /// A participant left (also observed by the leaver itself)
    UserLeft {
        username: String,
    },
    /// Shared buffer replaced by another participant
    CodeUpdated {
        code: String,
        username: String,
    },
    /// Language tag replaced by another participant
    LanguageUpdated {
        language: String,
        username: String,
    },
    /// Chat message (senders receive their own)
    NewMessage {
        username: String,
        message: String,
    },
    /// Relayed WebRTC offer
    #[serde(rename_all = "camelCase")]
    WebrtcOffer {
        offer: Value,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    /// Relayed WebRTC answer
    #[serde(rename_all = "camelCase")]
    WebrtcAnswer {
        answer: Value,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    /// Relayed WebRTC ICE candidate
    #[serde(rename_all = "camelCase")]
    WebrtcIce {
        candidate: Value,
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
}
