//! Error types for Shelltender

use thiserror::Error;

/// Main error type for the session core.
#[derive(Error, Debug)]
pub enum ShelltenderError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("shell not found: {0}")]
    ShellNotFound(String),

    #[error("failed to spawn PTY: {message} (command: {command}, args: {args:?}, cwd: {cwd}, platform: {platform})")]
    PtySpawnFailed {
        command: String,
        args: Vec<String>,
        cwd: String,
        platform: &'static str,
        message: String,
    },

    #[error("pattern failed to compile: {0}")]
    PatternCompile(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("rate limited")]
    RateLimited,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ShelltenderError>;
