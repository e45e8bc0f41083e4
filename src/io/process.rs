//! Process management layer
//!
//! Handles external process lifecycle, environment hand-off, stderr
//! monitoring and exit observation, completely separate from transport
//! and protocol concerns.

use crate::io::transport::StdioTransport;
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
// warn! is used in Windows-specific code blocks
use tracing::{error, info, trace, warn};

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask the process to terminate (SIGTERM)
    Graceful,
    /// Kill immediately (SIGKILL)
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has exited (either on its own or after a signal)
    Stopped,
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Process Exit Events
// ============================================================================

/// Event fired when the process exits, for whatever reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExitEvent {
    /// Exit code, absent when the process was terminated by a signal
    pub code: Option<i32>,
    /// Terminating signal (unix only)
    pub signal: Option<i32>,
}

impl ProcessExitEvent {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Exit with code 0
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ProcessExitEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

// ============================================================================
// Process Exit Handler Trait
// ============================================================================

/// Trait for handling process exit events
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    /// Called once when the process exits
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Stderr Monitoring Trait
// ============================================================================

/// Trait for monitoring stderr output from external processes
pub trait StderrMonitor: Send + Sync {
    /// Install a handler for stderr lines
    ///
    /// The handler will be called for each non-empty line received from stderr.
    /// Only one handler can be active at a time - installing a new handler
    /// will replace the previous one.
    ///
    /// Note: Monitoring starts automatically when the process starts.
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Trait for managing external process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the external process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Send a termination signal to the external process
    ///
    /// Does not wait for the exit; see `wait_for_exit`.
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    /// Check if the process is currently running
    fn is_running(&self) -> bool;

    /// Create a stdio transport for communicating with the process
    /// This consumes the stdin/stdout from the process
    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error>;

    /// Synchronous force kill for Drop trait implementations
    fn kill_sync(&mut self);
}

/// Manages child processes spawned via Command
pub struct ChildProcessManager {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Extra environment variables, layered over the inherited environment
    env: Vec<(String, String)>,

    /// Working directory for the process (optional)
    working_directory: Option<PathBuf>,

    /// Thread-safe process state
    state: Arc<Mutex<ProcessState>>,

    /// Stdio transport (created when process starts)
    stdio_transport: Option<StdioTransport>,

    /// Stderr handler
    stderr_handler: Option<Box<dyn Fn(String) + Send + Sync>>,

    /// Stderr monitoring task handle
    stderr_task: Option<JoinHandle<()>>,

    /// Process wait task handle (waits for child to exit)
    wait_task: Option<JoinHandle<()>>,

    /// Process exit event handler
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,

    /// Latest exit event, published by the wait task
    exit_sender: watch::Sender<Option<ProcessExitEvent>>,
}

impl ChildProcessManager {
    /// Create a new child process manager
    ///
    /// # Arguments
    /// * `command` - The command to execute
    /// * `args` - Command line arguments
    /// * `working_dir` - Optional working directory for the process
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        let (exit_sender, _) = watch::channel(None);
        Self {
            command,
            args,
            env: Vec::new(),
            working_directory: working_dir,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            stdio_transport: None,
            stderr_handler: None,
            stderr_task: None,
            wait_task: None,
            exit_handler: None,
            exit_sender,
        }
    }

    /// Add environment variables handed to the child at spawn time
    pub fn with_env<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    /// Install the handler fired when the child exits
    pub fn on_process_exit(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        self.exit_handler = Some(handler);
    }

    /// Get current process state (thread-safe)
    pub fn get_state(&self) -> ProcessState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().clone()
    }

    /// Process ID while running
    pub fn pid(&self) -> Option<u32> {
        self.get_state().pid()
    }

    /// Wait up to `timeout` for the process to exit
    ///
    /// Returns the exit event, or `None` if the process is still alive.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<ProcessExitEvent> {
        let mut receiver = self.exit_sender.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                if let Some(event) = *receiver.borrow_and_update() {
                    return Some(event);
                }
                if receiver.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;

        waited.ok().flatten()
    }

    /// Spawn the stderr monitoring task with a provided stderr pipe
    ///
    /// Always drains stderr to prevent the child process from blocking.
    /// If a handler is installed, lines are forwarded to it.
    fn spawn_stderr_monitor_with_pipe(&mut self, stderr: tokio::process::ChildStderr) {
        if self.stderr_task.is_some() {
            return;
        }

        let handler = self.stderr_handler.take();

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            trace!(
                "ChildProcessManager: Starting stderr monitoring (handler: {})",
                if handler.is_some() {
                    "installed"
                } else {
                    "draining only"
                }
            );

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        let line_content = line.trim().to_string();
                        if line_content.is_empty() {
                            continue;
                        }
                        match handler {
                            Some(ref handler) => handler(line_content),
                            None => trace!("ChildProcessManager: stderr drained: {}", line_content),
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }

            trace!("ChildProcessManager: stderr monitoring finished");
        });

        self.stderr_task = Some(task);
    }

    /// Spawn the wait task that monitors child process exit
    fn spawn_wait_task(&mut self, mut child: Child) {
        let current_pid = self.pid();
        let exit_handler = self.exit_handler.clone();
        let state = Arc::clone(&self.state);
        let exit_sender = self.exit_sender.clone();

        let task = tokio::spawn(async move {
            trace!(
                "ChildProcessManager: Starting wait task for PID {:?}",
                current_pid
            );

            let event = match child.wait().await {
                Ok(exit_status) => {
                    info!(
                        "Process PID {:?} exited with status: {}",
                        current_pid, exit_status
                    );
                    ProcessExitEvent::from_status(exit_status)
                }
                Err(e) => {
                    error!("Error waiting for child process: {}", e);
                    ProcessExitEvent {
                        code: None,
                        signal: None,
                    }
                }
            };

            if let Ok(mut process_state) = state.lock() {
                *process_state = ProcessState::Stopped;
            }
            exit_sender.send_replace(Some(event));

            if let Some(handler) = &exit_handler {
                handler.on_process_exit(event).await;
            }

            trace!(
                "ChildProcessManager: Wait task finished for PID {:?}",
                current_pid
            );
        });

        self.wait_task = Some(task);
    }

    #[cfg(unix)]
    fn signal(pid: u32, mode: StopMode) {
        let signal = match mode {
            StopMode::Graceful => libc::SIGTERM,
            StopMode::Force => libc::SIGKILL,
        };
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            info!("Sent {:?} signal to process {}", mode, pid);
        } else {
            warn!(
                "Failed to signal process {}: {}",
                pid,
                io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    fn signal(pid: u32, _mode: StopMode) {
        warn!("Process termination not implemented on this platform (PID {pid})");
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder.spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("Failed to get process ID")))?;
        info!("Process started with PID: {}", pid);

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = ProcessState::Running { pid };
        self.exit_sender.send_replace(None);

        // Extract stdio streams before moving child to wait task
        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        self.stdio_transport = Some(StdioTransport::new(stdin, stdout));

        // Always start stderr monitoring so the child never blocks on a full pipe
        self.spawn_stderr_monitor_with_pipe(stderr);

        // Wait task consumes the child
        self.spawn_wait_task(child);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = self.pid().ok_or(ProcessError::NotStarted)?;

        match mode {
            StopMode::Graceful => info!("Gracefully stopping process with PID: {}", pid),
            StopMode::Force => info!("Force killing process with PID: {}", pid),
        }

        Self::signal(pid, mode);

        // The wait task flips state to Stopped once the exit is observed
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn create_stdio_transport(&mut self) -> Result<StdioTransport, Self::Error> {
        self.stdio_transport.take().ok_or(ProcessError::NotStarted)
    }

    fn kill_sync(&mut self) {
        let Some(pid) = self.pid() else {
            return;
        };

        info!("Synchronously force killing process with PID: {}", pid);
        Self::signal(pid, StopMode::Force);

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

impl StderrMonitor for ChildProcessManager {
    fn on_stderr_line<F>(&mut self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Box::new(handler));
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}
