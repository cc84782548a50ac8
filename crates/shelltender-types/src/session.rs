//! Session data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Terminal dimensions must stay within this exclusive upper bound.
pub const MAX_DIMENSION: u16 = 1000;

/// One live PTY and its metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Opaque identifier, immutable for the session's lifetime.
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub cols: u16,
    pub rows: u16,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// When true the server rejects new client writes.
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<SessionRestrictions>,
}

impl Session {
    pub fn touch(&mut self) {
        let now = Utc::now();
        // lastAccessedAt is monotonically non-decreasing
        if now > self.last_accessed_at {
            self.last_accessed_at = now;
        }
    }
}

/// Constraints forwarded to a restricted-shell wrapper at spawn time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRestrictions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_root: Option<String>,
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// Caller-supplied parameters for `create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restrictions: Option<SessionRestrictions>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_round_trips_through_json() {
        let session = Session {
            id: "s1".to_string(),
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
            cols: 80,
            rows: 24,
            command: "/bin/sh".to_string(),
            args: vec!["-l".to_string()],
            cwd: "/tmp".to_string(),
            env: HashMap::from([("TERM".to_string(), "xterm-256color".to_string())]),
            locked: false,
            restrictions: None,
        };

        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, session.id);
        assert_eq!(back.cols, 80);
        assert_eq!(back.env.get("TERM").unwrap(), "xterm-256color");
    }

    #[test]
    fn touch_never_decreases_last_accessed() {
        let future = Utc::now() + chrono::Duration::hours(1);
        let mut session = Session {
            id: "s1".to_string(),
            created_at: Utc::now(),
            last_accessed_at: future,
            cols: 80,
            rows: 24,
            command: "/bin/sh".to_string(),
            args: vec![],
            cwd: "/".to_string(),
            env: HashMap::new(),
            locked: false,
            restrictions: None,
        };
        session.touch();
        assert_eq!(session.last_accessed_at, future);
    }
}
