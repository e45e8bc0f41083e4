//! Error types for the process supervisor
//!
//! Startup and lifecycle failures. Every variant can produce an
//! operator-facing remediation through `hint()`.

use std::time::Duration;

use crate::io::ProcessError;
use crate::rpc::RpcError;

// ============================================================================
// Supervisor Errors
// ============================================================================

/// Failures of `start`, `stop` and the restart machinery
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// No ready signal within the startup budget
    #[error("Mail tool did not become ready within {timeout:?}")]
    StartupTimeout { timeout: Duration },

    /// The executable or interpreter could not be spawned
    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The child reported its port is already bound
    #[error("Mail tool port {port:?} is already in use: {line}")]
    PortConflict { port: Option<u16>, line: String },

    /// The child rejected its credentials
    #[error("Mail tool authentication failed: {line}")]
    AuthenticationFailure { line: String },

    /// The child is missing a module or dependency
    #[error("Mail tool dependency missing: {line}")]
    MissingDependency { line: String },

    /// The child exited before it became ready
    #[error("Mail tool exited during startup (code: {code:?}, signal: {signal:?})")]
    ExitedDuringStartup {
        code: Option<i32>,
        signal: Option<i32>,
    },

    /// The post-readiness handshake request failed
    #[error("Handshake with mail tool failed: {0}")]
    Handshake(#[source] RpcError),

    /// Another start or stop is in progress
    #[error("Supervisor is busy with another start or stop")]
    AlreadyStarting,

    /// `stop` was called while the child was still starting
    #[error("Mail tool start cancelled by stop")]
    StartCancelled,

    /// The restart budget is exhausted
    #[error("Mail tool failed permanently after {attempts} restart attempt(s)")]
    PermanentFailure { attempts: u32 },

    /// Lower-level process management failure
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] SupervisorConfigError),
}

impl SupervisorError {
    /// Map a process start failure onto the startup taxonomy
    pub fn from_spawn(command: &str, error: ProcessError) -> Self {
        match error {
            ProcessError::Io(source) => SupervisorError::SpawnFailure {
                command: command.to_string(),
                source,
            },
            other => SupervisorError::Process(other),
        }
    }

    /// Short machine-readable kind, used in events and status output
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::StartupTimeout { .. } => "startup_timeout",
            SupervisorError::SpawnFailure { .. } => "spawn_failure",
            SupervisorError::PortConflict { .. } => "port_conflict",
            SupervisorError::AuthenticationFailure { .. } => "authentication_failure",
            SupervisorError::MissingDependency { .. } => "missing_dependency",
            SupervisorError::ExitedDuringStartup { .. } => "exited_during_startup",
            SupervisorError::Handshake(_) => "handshake",
            SupervisorError::AlreadyStarting => "already_starting",
            SupervisorError::StartCancelled => "start_cancelled",
            SupervisorError::PermanentFailure { .. } => "permanent_failure",
            SupervisorError::Process(_) => "process",
            SupervisorError::Config(_) => "config",
        }
    }

    /// Operator-facing remediation
    pub fn hint(&self) -> Option<String> {
        match self {
            SupervisorError::StartupTimeout { timeout } => Some(format!(
                "The tool printed no ready line within {timeout:?}. Check its stderr output above, \
                 or raise --startup-timeout-ms"
            )),
            SupervisorError::SpawnFailure { command, source } => {
                if source.kind() == std::io::ErrorKind::NotFound {
                    Some(format!(
                        "'{command}' was not found. Install it or pass --mcp-command with the full path"
                    ))
                } else {
                    Some(format!("Check that '{command}' is executable by this user"))
                }
            }
            SupervisorError::PortConflict { port, .. } => Some(match port {
                Some(port) => format!(
                    "Port {port} is taken. Free it or pick another one with --mcp-port / GMAIL_MCP_PORT"
                ),
                None => "Pick another port with --mcp-port / GMAIL_MCP_PORT".to_string(),
            }),
            SupervisorError::AuthenticationFailure { .. } => Some(
                "Set GOOGLE_OAUTH_CLIENT_ID and GOOGLE_OAUTH_CLIENT_SECRET, then re-authorize the mail tool"
                    .to_string(),
            ),
            SupervisorError::MissingDependency { .. } => Some(
                "Install the tool's dependencies (e.g. `pip install -r requirements.txt` in GOOGLE_WORKSPACE_MCP_PATH)"
                    .to_string(),
            ),
            SupervisorError::ExitedDuringStartup { .. } => {
                Some("The tool exited before it was ready; its stderr output explains why".to_string())
            }
            SupervisorError::Handshake(inner) => inner.hint(),
            SupervisorError::AlreadyStarting => {
                Some("Wait for the current start or stop to finish".to_string())
            }
            SupervisorError::StartCancelled => None,
            SupervisorError::PermanentFailure { .. } => Some(
                "The tool keeps crashing. Fix the cause reported above and restart the daemon"
                    .to_string(),
            ),
            SupervisorError::Process(_) => None,
            SupervisorError::Config(inner) => Some(inner.to_string()),
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorConfigError {
    /// Command is empty
    #[error("Command must not be empty")]
    EmptyCommand,

    /// Invalid timeout value
    #[error("Invalid {field}: {value:?} - {reason}")]
    InvalidTimeout {
        field: String,
        value: Duration,
        reason: String,
    },

    /// Inconsistent restart tuning
    #[error("Invalid restart configuration: {reason}")]
    InvalidRestart { reason: String },

    /// A port is configured but nothing hands it to the child
    #[error("A port is configured but no environment variable carries it to the child")]
    MissingPortVariable,

    /// A ready marker would match every line
    #[error("Ready markers must not be empty")]
    EmptyReadyMarker,
}

impl SupervisorConfigError {
    /// Create an invalid timeout error
    pub fn invalid_timeout(field: &str, value: Duration, reason: &str) -> Self {
        Self::InvalidTimeout {
            field: field.to_string(),
            value,
            reason: reason.to_string(),
        }
    }
}
