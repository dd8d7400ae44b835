use serde::Serialize;
use std::fmt;

/// Lifecycle of one provider session.
///
/// ```text
/// Idle ─start─▶ Starting ─ready/result─▶ Streaming ◀─┐
///                  │                        │        │
///                  │              limit/error/close  │
///                  │                        ▼        │
///                  │                   Restarting ───┘
///                  ▼
///   end/audio ends: Ended        repeated failures: Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Restarting,
    Ended,
    Failed,
}

impl SessionState {
    /// No further transitions happen from here.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }

    /// A task is running for the session.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Streaming | SessionState::Restarting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Streaming => "streaming",
            SessionState::Restarting => "restarting",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
