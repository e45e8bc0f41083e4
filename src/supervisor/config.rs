//! Configuration for the process supervisor
//!
//! Provides SupervisorConfig with a builder, defaults and validation.
//! The supervisor itself is tool-agnostic; everything specific to one
//! child tool (command line, environment, ready markers, handshake)
//! arrives through this configuration.

use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use crate::supervisor::error::SupervisorConfigError;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default number of automatic restarts before giving up
pub const DEFAULT_RESTART_ATTEMPTS: u32 = 3;

/// Default startup budget (15 seconds)
///
/// Interpreted tools import a lot of modules before printing their ready
/// line; this has to cover a cold start.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 15_000;

/// Default per-request budget (30 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Assume ready after this long if the process is still alive
pub const DEFAULT_READY_FALLBACK_MS: u64 = 2_000;

/// Time given to the child to honor the protocol-level shutdown message
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 500;

/// Time between SIGTERM and SIGKILL
pub const DEFAULT_KILL_GRACE_MS: u64 = 8_000;

/// First restart delay; doubles per attempt
pub const DEFAULT_RESTART_BASE_DELAY_MS: u64 = 2_000;

/// Upper bound for the restart delay
pub const DEFAULT_RESTART_MAX_DELAY_MS: u64 = 60_000;

/// Uninterrupted running time after which the restart counter resets
pub const DEFAULT_STABILITY_WINDOW_MS: u64 = 60_000;

/// Maximum startup timeout accepted by validation (5 minutes)
pub const MAX_STARTUP_TIMEOUT_MS: u64 = 300_000;

/// Environment variables that receive the negotiated port by default
pub const DEFAULT_PORT_ENV_VARS: [&str; 2] = ["PORT", "MCP_PORT"];

/// Output substrings that count as a readiness signal by default
pub const DEFAULT_READY_MARKERS: [&str; 5] = [
    "MCP server running",
    "Server started",
    "ready",
    "Listening on",
    "Starting server",
];

// ============================================================================
// Core Configuration Types
// ============================================================================

/// Complete supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Executable to spawn
    pub command: String,

    /// Command-line arguments
    pub args: Vec<String>,

    /// Working directory for the child (inherits ours if `None`)
    pub working_directory: Option<PathBuf>,

    /// Extra environment handed to the child
    pub env: Vec<(String, String)>,

    /// Port the child should listen on, if any
    pub port: Option<u16>,

    /// Variables that carry `port` into the child environment
    pub port_env_vars: Vec<String>,

    /// Budget for the whole start sequence
    pub startup_timeout: Duration,

    /// Default per-request budget
    pub request_timeout: Duration,

    /// Assume ready after this delay if still alive; `None` disables
    pub ready_fallback: Option<Duration>,

    /// Output substrings treated as the ready signal
    pub ready_markers: Vec<String>,

    /// Wait after the shutdown message before signalling
    pub shutdown_grace: Duration,

    /// Wait after SIGTERM before SIGKILL
    pub kill_grace: Duration,

    /// Restart policy tuning
    pub restart: RestartConfig,

    /// Request sent once the child is ready; failure aborts the start
    pub handshake: Option<Handshake>,
}

/// Restart policy tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub stability_window: Duration,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RESTART_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RESTART_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RESTART_MAX_DELAY_MS),
            stability_window: Duration::from_millis(DEFAULT_STABILITY_WINDOW_MS),
        }
    }
}

/// Post-readiness handshake request
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub method: String,
    pub params: Value,
}

impl SupervisorConfig {
    /// Start building a configuration for `command`
    pub fn builder(command: impl Into<String>) -> SupervisorConfigBuilder {
        SupervisorConfigBuilder::new(command)
    }

    /// Full environment handed to the child: port variables, then extras
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = match self.port {
            Some(port) => self
                .port_env_vars
                .iter()
                .map(|name| (name.clone(), port.to_string()))
                .collect(),
            None => Vec::new(),
        };
        env.extend(self.env.iter().cloned());
        env
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for SupervisorConfig with validation and defaults
#[derive(Debug)]
pub struct SupervisorConfigBuilder {
    command: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    env: Vec<(String, String)>,
    port: Option<u16>,
    port_env_vars: Option<Vec<String>>,
    startup_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    ready_fallback: Option<Option<Duration>>,
    ready_markers: Option<Vec<String>>,
    shutdown_grace: Option<Duration>,
    kill_grace: Option<Duration>,
    restart: RestartConfig,
    handshake: Option<Handshake>,
}

impl SupervisorConfigBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            env: Vec::new(),
            port: None,
            port_env_vars: None,
            startup_timeout: None,
            request_timeout: None,
            ready_fallback: None,
            ready_markers: None,
            shutdown_grace: None,
            kill_grace: None,
            restart: RestartConfig::default(),
            handshake: None,
        }
    }

    /// Add a command-line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple command-line arguments
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    /// Add an environment variable for the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Replace the variables that carry the port into the child environment
    pub fn port_env_vars(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.port_env_vars = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set or disable (`None`) the "still alive means ready" fallback
    pub fn ready_fallback(mut self, fallback: Option<Duration>) -> Self {
        self.ready_fallback = Some(fallback);
        self
    }

    /// Replace the ready markers
    pub fn ready_markers(mut self, markers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ready_markers = Some(markers.into_iter().map(Into::into).collect());
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = Some(grace);
        self
    }

    pub fn restart_attempts(mut self, attempts: u32) -> Self {
        self.restart.max_attempts = attempts;
        self
    }

    pub fn restart_delays(mut self, base: Duration, max: Duration) -> Self {
        self.restart.base_delay = base;
        self.restart.max_delay = max;
        self
    }

    pub fn stability_window(mut self, window: Duration) -> Self {
        self.restart.stability_window = window;
        self
    }

    pub fn handshake(mut self, method: impl Into<String>, params: Value) -> Self {
        self.handshake = Some(Handshake {
            method: method.into(),
            params,
        });
        self
    }

    /// Build the configuration with validation
    pub fn build(self) -> Result<SupervisorConfig, SupervisorConfigError> {
        let config = SupervisorConfig {
            command: self.command,
            args: self.args,
            working_directory: self.working_directory,
            env: self.env,
            port: self.port,
            port_env_vars: self.port_env_vars.unwrap_or_else(|| {
                DEFAULT_PORT_ENV_VARS.iter().map(|s| s.to_string()).collect()
            }),
            startup_timeout: self
                .startup_timeout
                .unwrap_or(Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS)),
            request_timeout: self
                .request_timeout
                .unwrap_or(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)),
            ready_fallback: self
                .ready_fallback
                .unwrap_or(Some(Duration::from_millis(DEFAULT_READY_FALLBACK_MS))),
            ready_markers: self.ready_markers.unwrap_or_else(|| {
                DEFAULT_READY_MARKERS.iter().map(|s| s.to_string()).collect()
            }),
            shutdown_grace: self
                .shutdown_grace
                .unwrap_or(Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS)),
            kill_grace: self
                .kill_grace
                .unwrap_or(Duration::from_millis(DEFAULT_KILL_GRACE_MS)),
            restart: self.restart,
            handshake: self.handshake,
        };

        validate(&config)?;
        Ok(config)
    }
}

/// Validate a configuration
pub fn validate(config: &SupervisorConfig) -> Result<(), SupervisorConfigError> {
    if config.command.trim().is_empty() {
        return Err(SupervisorConfigError::EmptyCommand);
    }

    if config.startup_timeout.is_zero() {
        return Err(SupervisorConfigError::invalid_timeout(
            "startup_timeout",
            config.startup_timeout,
            "must be greater than zero",
        ));
    }
    if config.startup_timeout > Duration::from_millis(MAX_STARTUP_TIMEOUT_MS) {
        return Err(SupervisorConfigError::invalid_timeout(
            "startup_timeout",
            config.startup_timeout,
            "exceeds the 5 minute maximum",
        ));
    }
    if config.request_timeout.is_zero() {
        return Err(SupervisorConfigError::invalid_timeout(
            "request_timeout",
            config.request_timeout,
            "must be greater than zero",
        ));
    }
    if config.kill_grace.is_zero() {
        return Err(SupervisorConfigError::invalid_timeout(
            "kill_grace",
            config.kill_grace,
            "must be greater than zero",
        ));
    }

    if config.restart.base_delay > config.restart.max_delay {
        return Err(SupervisorConfigError::InvalidRestart {
            reason: format!(
                "base delay {:?} exceeds max delay {:?}",
                config.restart.base_delay, config.restart.max_delay
            ),
        });
    }

    if config.port.is_some() && config.port_env_vars.is_empty() {
        return Err(SupervisorConfigError::MissingPortVariable);
    }

    if config.ready_markers.iter().any(|m| m.is_empty()) {
        return Err(SupervisorConfigError::EmptyReadyMarker);
    }

    Ok(())
}
