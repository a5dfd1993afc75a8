//! JSON wire protocol for document synchronization.
//!
//! Frames are WebSocket text messages. The server may coalesce several
//! messages into one JSON array frame, so inbound decoding is per element:
//!
//! ```text
//! single:  {"type":"update","deltas":[...],"startMsgId":...}
//! batched: [ {"type":"cursor_update",...}, {"type":"update",...}, ... ]
//! ```
//!
//! One malformed element never blocks its siblings; each element decodes
//! independently and failures surface with the offending payload attached.
//! Message tags are snake_case; delta payloads use the camelCase field names
//! of [`tandem_ot::Delta`].

use serde::{Deserialize, Serialize};
use tandem_ot::Delta;
use uuid::Uuid;

/// Roster entry shipped with `addclient` / `removeclient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: Uuid,
    pub name: String,
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a fresh socket.
    Connect {
        room_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Ask for the full document; also the resync path.
    InitialDumpRequest { room_id: String, client_id: Uuid },
    /// The entire pending queue, tagged with the highest server message id
    /// this client has incorporated.
    Update {
        room_id: String,
        client_id: Uuid,
        deltas: Vec<Delta>,
        last_msg_id: i64,
    },
    /// Cursor moved; 0-indexed on the wire.
    Cursor { client_id: Uuid, ln: u32, pos: u32 },
    /// Typing state changed.
    Typing { client_id: Uuid, is_typing: bool },
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Identity assignment; completes the handshake.
    ConnectAck { client_id: Uuid },
    /// Full document content and the stream position it reflects.
    InitialDump { content: String, last_msg_id: i64 },
    /// Committed remote batch. `start_msg_id` is the stream position BEFORE
    /// the batch: it covers ids `start_msg_id+1 ..= start_msg_id+len`.
    Update { deltas: Vec<Delta>, start_msg_id: i64 },
    /// The sender's first `count` pending deltas were committed.
    TextAccepted { count: usize },
    /// A peer's cursor moved.
    CursorUpdate {
        client_id: Uuid,
        name: String,
        ln: u32,
        pos: u32,
    },
    /// A peer's typing state changed.
    TypingIndicator { client_id: Uuid, typing: bool },
    /// Full roster snapshot after a join.
    #[serde(rename = "addclient")]
    AddClient { clients: Vec<ClientInfo> },
    /// Roster entries that left.
    #[serde(rename = "removeclient")]
    RemoveClient { clients: Vec<ClientInfo> },
}

impl ClientMessage {
    /// Serialize to a wire frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize a single client frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::deserialization(e, text))
    }

    /// Deserialize a frame that may be a single message or an array.
    ///
    /// Clients normally send one message per frame, but the format permits
    /// batching just like server frames do.
    pub fn decode_frame(text: &str) -> Vec<Result<Self, ProtocolError>> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return vec![Err(ProtocolError::deserialization(e, text))],
        };
        match value {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| {
                    let rendered = item.to_string();
                    serde_json::from_value(item)
                        .map_err(|e| ProtocolError::deserialization(e, &rendered))
                })
                .collect(),
            other => {
                let rendered = other.to_string();
                vec![serde_json::from_value(other)
                    .map_err(|e| ProtocolError::deserialization(e, &rendered))]
            }
        }
    }
}

impl ServerMessage {
    /// Serialize to a wire frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Serialize a batch as one JSON array frame.
    pub fn encode_batch(messages: &[ServerMessage]) -> Result<String, ProtocolError> {
        serde_json::to_string(messages)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize a single server frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::deserialization(e, text))
    }

    /// Deserialize a frame that may be a single message or an array.
    ///
    /// Every element gets its own slot so a bad sibling cannot suppress the
    /// good ones; an unparseable frame yields exactly one error.
    pub fn decode_frame(text: &str) -> Vec<Result<Self, ProtocolError>> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => return vec![Err(ProtocolError::deserialization(e, text))],
        };
        match value {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| {
                    let rendered = item.to_string();
                    serde_json::from_value(item)
                        .map_err(|e| ProtocolError::deserialization(e, &rendered))
                })
                .collect(),
            other => {
                let rendered = other.to_string();
                vec![serde_json::from_value(other)
                    .map_err(|e| ProtocolError::deserialization(e, &rendered))]
            }
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    SerializationError(String),
    /// Decode failure with a preview of the offending payload.
    DeserializationError(String),
}

impl ProtocolError {
    fn deserialization(err: serde_json::Error, payload: &str) -> Self {
        Self::DeserializationError(format!("{err}; payload: {}", preview(payload)))
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// First chunk of a payload, enough to identify it in a log line.
fn preview(payload: &str) -> String {
    const MAX: usize = 120;
    if payload.chars().count() <= MAX {
        payload.to_string()
    } else {
        let cut: String = payload.chars().take(MAX).collect();
        format!("{cut}…")
    }
}
