//! Pattern configuration and terminal events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Where a chunk of data originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Pty,
    User,
    System,
    Admin,
    /// Buffer contents replayed after a process restart. Never re-persisted
    /// and never pattern-scanned.
    Restored,
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataSource::Pty => "pty",
            DataSource::User => "user",
            DataSource::System => "system",
            DataSource::Admin => "admin",
            DataSource::Restored => "restored",
        };
        f.write_str(s)
    }
}

/// A match rule registered against a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternConfig {
    /// Stable identifier the client uses to correlate events.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PatternKind,
    /// Literal text, regex source, or the name of a server-side predicate.
    pub pattern: String,
    #[serde(default)]
    pub options: PatternOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    String,
    Regex,
    /// Only accepted over the wire when it names a predicate registered
    /// server-side; arbitrary functions are never deserialized.
    Custom,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatternOptions {
    /// Suppress a repeat of the same match within this many milliseconds.
    #[serde(default)]
    pub debounce: u64,
    #[serde(default)]
    pub multiline: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_lines: Option<u32>,
}

/// Typed event emitted by the pattern engine or session lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum TerminalEvent {
    PatternMatch {
        session_id: String,
        pattern_name: String,
        r#match: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        groups: Option<HashMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_before: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_after: Option<Vec<String>>,
        timestamp: DateTime<Utc>,
    },
    Bell {
        session_id: String,
        timestamp: DateTime<Utc>,
    },
    Exit {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        timestamp: DateTime<Utc>,
    },
    Error {
        session_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl TerminalEvent {
    /// The wire name of this event's discriminator, used for per-client
    /// event-type subscription filtering.
    pub fn type_name(&self) -> &'static str {
        match self {
            TerminalEvent::PatternMatch { .. } => "pattern-match",
            TerminalEvent::Bell { .. } => "bell",
            TerminalEvent::Exit { .. } => "exit",
            TerminalEvent::Error { .. } => "error",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            TerminalEvent::PatternMatch { session_id, .. }
            | TerminalEvent::Bell { session_id, .. }
            | TerminalEvent::Exit { session_id, .. }
            | TerminalEvent::Error { session_id, .. } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_match_wire_shape() {
        let event = TerminalEvent::PatternMatch {
            session_id: "s1".to_string(),
            pattern_name: "errors".to_string(),
            r#match: "ERROR".to_string(),
            groups: None,
            context_before: None,
            context_after: None,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "pattern-match");
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["patternName"], "errors");
        assert_eq!(value["match"], "ERROR");
    }

    #[test]
    fn pattern_config_parses_wire_json() {
        let config: PatternConfig = serde_json::from_str(
            r#"{"name":"err","type":"regex","pattern":"ERROR","options":{"debounce":500}}"#,
        )
        .unwrap();
        assert_eq!(config.kind, PatternKind::Regex);
        assert_eq!(config.options.debounce, 500);
        assert!(!config.options.multiline);
    }
}
