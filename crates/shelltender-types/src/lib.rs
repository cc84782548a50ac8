//! Shared types for Shelltender
//!
//! Contains the session data model, the pattern/event types and the
//! WebSocket wire protocol shared between the core and the server.

pub mod event;
pub mod message;
pub mod session;

pub use event::{DataSource, PatternConfig, PatternKind, PatternOptions, TerminalEvent};
pub use message::{ClientMessage, ServerMessage};
pub use session::{Session, SessionOptions, SessionRestrictions};
