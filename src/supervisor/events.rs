//! Typed lifecycle events
//!
//! Published on a broadcast channel; observers match on the variant
//! instead of subscribing to named string events.

use std::time::Duration;

/// Capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle event emitted by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The child is running and ready
    Started { pid: u32 },
    /// The child stopped on request or exited cleanly
    Stopped,
    /// Non-fatal problem worth surfacing
    Error { kind: ErrorKind, message: String },
    /// The child exited unexpectedly
    Crashed {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// A restart is scheduled after `delay`
    Restarting { attempt: u32, delay: Duration },
    /// A request was written to the child
    Request { id: String, method: String },
    /// A response settled a pending request
    Response { id: String, success: bool },
    /// The restart budget is exhausted; the owner should shut down
    PermanentFailure { attempts: u32 },
}

impl SupervisorEvent {
    /// Stable name, handy for logs
    pub fn name(&self) -> &'static str {
        match self {
            SupervisorEvent::Started { .. } => "started",
            SupervisorEvent::Stopped => "stopped",
            SupervisorEvent::Error { .. } => "error",
            SupervisorEvent::Crashed { .. } => "crashed",
            SupervisorEvent::Restarting { .. } => "restarting",
            SupervisorEvent::Request { .. } => "request",
            SupervisorEvent::Response { .. } => "response",
            SupervisorEvent::PermanentFailure { .. } => "permanent_failure",
        }
    }
}

/// Category of an `Error` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Auth keywords on stderr after startup; the child keeps running
    AuthenticationLost,
    /// Port conflict reported after startup
    PortConflict,
    /// Missing module reported after startup
    MissingDependency,
    /// A restart attempt failed to start the child
    RestartFailed,
    /// Writing to the child's stdin failed
    Transport,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::AuthenticationLost => "authentication_lost",
            ErrorKind::PortConflict => "port_conflict",
            ErrorKind::MissingDependency => "missing_dependency",
            ErrorKind::RestartFailed => "restart_failed",
            ErrorKind::Transport => "transport",
        };
        f.write_str(name)
    }
}
