pub mod paths;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Unique identifier for a session.
pub type SessionId = String;

/// Opaque participant identity, supplied by the caller.
pub type ParticipantId = String;

/// Maximum length of one JSON line on the wire.
pub const MAX_JSON_LINE_BYTES: usize = 1024 * 1024;

/// The closed set of event categories a session can publish into.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Chunk,
    ToolCall,
    AgentState,
    Presence,
    Terminal,
    Workflow,
    Connected,
    Error,
}

impl Channel {
    /// All channels, in a stable order.
    pub const ALL: [Channel; 8] = [
        Channel::Chunk,
        Channel::ToolCall,
        Channel::AgentState,
        Channel::Presence,
        Channel::Terminal,
        Channel::Workflow,
        Channel::Connected,
        Channel::Error,
    ];
}

/// The stored form of an event: one unit of a session's append-only log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub offset: u64,
    pub channel: Channel,
    pub timestamp_epoch_ms: u64,
    pub data: serde_json::Value,
}

/// Session lifecycle state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    Active,
    Paused,
    Closing,
    Closed,
    Error,
}

/// Payload attached to a fatal lifecycle error.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Lifecycle events accepted by a session's state machine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Initialize,
    Ready,
    Join { participant: ParticipantId },
    Leave { participant: ParticipantId },
    Heartbeat,
    Pause,
    Resume,
    Timeout,
    Close,
    Error { error: ErrorInfo },
}

/// Summary info returned by session list/info commands.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub participants: Vec<ParticipantId>,
    pub max_participants: usize,
    pub created_at_epoch_ms: u64,
    pub last_activity_epoch_ms: u64,
    /// Offset of the most recently published entry, if any.
    pub head_offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Client-to-server requests sent as JSON-lines over the Unix socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    SessionCreate {
        #[serde(default)]
        session_id: Option<SessionId>,
        #[serde(default = "default_max_participants")]
        max_participants: usize,
    },
    /// The only way callers mutate a session's membership/activity.
    SessionSend {
        session_id: SessionId,
        event: LifecycleEvent,
    },
    SessionInfo {
        session_id: SessionId,
    },
    SessionList,
    Publish {
        session_id: SessionId,
        channel: Channel,
        data: serde_json::Value,
    },
    Subscribe {
        session_id: SessionId,
        #[serde(default)]
        from_offset: Option<u64>,
    },
    Unsubscribe {
        session_id: SessionId,
    },
}

/// Server-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Event(LogEntry),
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    SessionClosed,
    CapacityReached,
    NotParticipant,
    InvalidTransition,
    ReplayWindowExceeded,
    InvalidRequest,
    ServerError,
}

fn default_max_participants() -> usize {
    8
}

/// Milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// Typed payloads for the channels that carry structured data. The log
// itself stores `serde_json::Value`; these are the shapes producers and
// consumers agree on.

/// Streamed text from the agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChunkData {
    pub text: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallPhase {
    Started,
    Updated,
    Completed,
    Failed,
}

/// One step of a tool-call lifecycle.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolCallData {
    pub call_id: String,
    pub name: String,
    pub phase: ToolCallPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Joined,
    Left,
    Heartbeat,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PresenceData {
    pub participant: ParticipantId,
    pub status: PresenceStatus,
}

/// Raw terminal bytes, base64 on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TerminalData {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Base64 encoding for byte arrays in JSON.
pub mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tag_format() {
        let req = Request::SessionList;
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"cmd":"session_list"}"#);
    }

    #[test]
    fn request_defaults() {
        let json = r#"{"cmd":"session_create"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        match req {
            Request::SessionCreate {
                session_id,
                max_participants,
            } => {
                assert!(session_id.is_none());
                assert_eq!(max_participants, 8);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn subscribe_from_offset_optional() {
        let json = r#"{"cmd":"subscribe","session_id":"s-1"}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        match req {
            Request::Subscribe { from_offset, .. } => assert!(from_offset.is_none()),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn channel_wire_names() {
        assert_eq!(
            serde_json::to_string(&Channel::ToolCall).unwrap(),
            "\"tool_call\""
        );
        assert_eq!(
            serde_json::from_str::<Channel>("\"agent_state\"").unwrap(),
            Channel::AgentState
        );
    }

    #[test]
    fn lifecycle_event_roundtrip() {
        let event = LifecycleEvent::Join {
            participant: "u1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"join","participant":"u1"}"#);
        let parsed: LifecycleEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn response_event_carries_entry_inline() {
        let resp = Response::Event(LogEntry {
            offset: 3,
            channel: Channel::Chunk,
            timestamp_epoch_ms: 1_700_000_000_000,
            data: serde_json::json!({"text": "a", "done": false}),
        });
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""type":"event""#));
        assert!(json.contains(r#""offset":3"#));
        let parsed: Response = serde_json::from_str(&json).unwrap();
        match parsed {
            Response::Event(entry) => {
                assert_eq!(entry.offset, 3);
                assert_eq!(entry.channel, Channel::Chunk);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn error_response_roundtrip() {
        let resp = Response::Error {
            message: "capacity reached".to_string(),
            code: ErrorCode::CapacityReached,
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("capacity_reached"));
        let parsed: Response = serde_json::from_str(&json).unwrap();
        match parsed {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::CapacityReached),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn terminal_data_base64_roundtrip() {
        let payload = TerminalData {
            data: b"\x1b[2Jls -la\n".to_vec(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("ls -la"));
        let parsed: TerminalData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.data, payload.data);
    }
}
