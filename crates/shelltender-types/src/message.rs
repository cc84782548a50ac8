//! WebSocket message protocol
//!
//! JSON framing, one message per frame, `type` discriminator. Sequence
//! numbers are unsigned 64-bit and strictly per-session.

use crate::event::{PatternConfig, TerminalEvent};
use crate::session::{Session, SessionOptions};
use serde::{Deserialize, Serialize};

/// Client -> Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Create a session, or attach when `options.id` already exists.
    Create {
        #[serde(default)]
        options: Option<SessionOptions>,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    /// Subscribe to a session, with full or incremental replay.
    Connect {
        session_id: String,
        #[serde(default)]
        use_incremental_updates: Option<bool>,
        #[serde(default)]
        last_sequence: Option<u64>,
    },
    Input {
        session_id: String,
        data: String,
    },
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    Disconnect {
        session_id: String,
    },
    RegisterPattern {
        session_id: String,
        config: PatternConfig,
        #[serde(default)]
        request_id: Option<String>,
    },
    UnregisterPattern {
        pattern_id: String,
        #[serde(default)]
        request_id: Option<String>,
    },
    SubscribeEvents {
        event_types: Vec<String>,
    },
    UnsubscribeEvents {
        event_types: Vec<String>,
    },
    /// Read-only firehose of all sessions, gated on the monitor key.
    MonitorAll {
        auth_key: String,
    },
    AdminList,
    AdminAttach {
        session_id: String,
    },
    AdminDetach {
        session_id: String,
    },
    AdminInput {
        session_id: String,
        data: String,
    },
}

/// Server -> Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Created {
        session_id: String,
        session: Session,
    },
    /// Reply to `connect`. Exactly one of `scrollback` (full replay) or
    /// `incremental_data`/`from_sequence` (catch-up) is populated.
    Connect {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scrollback: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        incremental_data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_sequence: Option<u64>,
        last_sequence: u64,
    },
    Output {
        session_id: String,
        data: String,
        sequence: u64,
    },
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    Error {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Bell {
        session_id: String,
    },
    Exit {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    TerminalEvent {
        session_id: String,
        pattern_id: String,
        event: TerminalEvent,
    },
    PatternRegistered {
        pattern_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    PatternUnregistered {
        pattern_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Subscribed {
        event_types: Vec<String>,
    },
    Unsubscribed {
        event_types: Vec<String>,
    },
    MonitorModeEnabled,
    /// Firehose frame for monitor clients; carries every session's output.
    SessionOutput {
        session_id: String,
        data: String,
        sequence: u64,
    },
    AdminSessions {
        sessions: Vec<Session>,
    },
    AdminAttached {
        session_id: String,
        buffer: String,
    },
    AdminDetached {
        session_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_use_kebab_case_tags() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"connect","sessionId":"s1","useIncrementalUpdates":true,"lastSequence":7}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Connect {
                session_id,
                use_incremental_updates,
                last_sequence,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(use_incremental_updates, Some(true));
                assert_eq!(last_sequence, Some(7));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"monitor-all","authKey":"k"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::MonitorAll { .. }));
    }

    #[test]
    fn error_frame_shape() {
        let msg = ServerMessage::Error {
            data: "session not found: s9".to_string(),
            request_id: Some("r1".to_string()),
            session_id: Some("s9".to_string()),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"], "session not found: s9");
        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["sessionId"], "s9");
    }

    #[test]
    fn output_frame_carries_sequence() {
        let msg = ServerMessage::Output {
            session_id: "s1".to_string(),
            data: "hello".to_string(),
            sequence: 42,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "output");
        assert_eq!(value["sequence"], 42);
    }

    #[test]
    fn incremental_connect_reply_omits_scrollback() {
        let msg = ServerMessage::Connect {
            session_id: "s1".to_string(),
            scrollback: None,
            incremental_data: Some("tail".to_string()),
            from_sequence: Some(7),
            last_sequence: 10,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("scrollback").is_none());
        assert_eq!(value["incrementalData"], "tail");
        assert_eq!(value["fromSequence"], 7);
        assert_eq!(value["lastSequence"], 10);
    }
}
