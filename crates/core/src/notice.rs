use crate::mode::Mode;
use crate::state::{ConnectionStatus, SessionState};
use serde::Serialize;

/// Notifications for the user-facing shell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Notice {
    State(SessionState),
    Status(ConnectionStatus),
    /// Persistent failure. The session can be started again.
    Error(String),
    Mode(Mode),
    /// Transient reconnect countdown.
    Retry(String),
    Safety(bool),
    /// Error and retry messages no longer apply.
    Cleared,
}
