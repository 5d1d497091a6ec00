pub mod builtin;
pub mod functions;
pub mod notify;

pub use functions::{
    AgentFunction, FunctionDefinition, FunctionError, FunctionOutcome, FunctionRegistry,
    InjectAgentMessage,
};
pub use notify::{ChannelNotifier, LogNotifier, Notification, NotificationSink};

use serde::Serialize;
use std::fmt;

/// Lifecycle of a single voice session.
///
/// A session only ever moves forward through these states; `Closed` is
/// terminal. The engine publishes every transition so that outside observers
/// (a UI, the binary's shutdown logic, tests) can follow along without holding
/// a reference to the session itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, nothing has been attempted yet.
    Idle,
    /// Opening the socket and sending the settings handshake.
    Connecting,
    /// Audio pipelines and protocol tasks are running.
    Active,
    /// Tasks have been told to stop and resources are being released.
    Closing,
    /// Everything has been released. Terminal.
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
