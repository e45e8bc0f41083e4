//! Process supervisor
//!
//! Owns one child tool process at a time and multiplexes concurrent
//! JSON-RPC requests over its stdio. Responsibilities:
//!
//! - Start: spawn with the configured environment, wait for the first
//!   startup signal (ready marker, fatal stderr line, exit, fallback or
//!   timeout), run the optional handshake, tear down on any failure
//! - Requests: register with a per-request timeout, write one framed
//!   line, settle from the stdout dispatch loop
//! - Crashes: reject everything pending, emit `Crashed`, drive the
//!   restart policy from a single loop
//! - Stop: shutdown message, SIGTERM, SIGKILL after the kill grace
//!
//! Start and stop are serialized by a lifecycle lock; a crash exit is
//! matched to its process by a generation number so exits from torn-down
//! processes are ignored.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, trace, warn};

use crate::io::{
    ChildProcessManager, ProcessExitEvent, ProcessExitHandler, ProcessManager, StderrMonitor,
    StdinWriter, StdoutReader, StopMode, WriteOutcome,
};
use crate::rpc::registry::PendingInfo;
use crate::rpc::{
    DispatchOutcome, JsonRpcRequest, LineFramer, RequestRegistry, RpcError, dispatch_line,
    generate_request_id,
};
use crate::supervisor::config::{Handshake, SupervisorConfig};
use crate::supervisor::error::SupervisorError;
use crate::supervisor::events::{EVENT_CHANNEL_CAPACITY, ErrorKind, SupervisorEvent};
use crate::supervisor::restart::{RestartDecision, RestartPolicy, RestartState};
use crate::supervisor::status::{StatusSnapshot, SupervisorStatus};
use crate::supervisor::stderr::{LineClass, ReadyDetector, StderrClassifier};

/// How long to wait for the kernel to reap a SIGKILLed child
const FORCE_KILL_REAP_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Startup Gate
// ============================================================================

/// First thing that happened to a starting child
#[derive(Debug)]
enum StartupSignal {
    Ready { marker: String },
    Fatal(SupervisorError),
    Exited(ProcessExitEvent),
}

/// Open while a start is waiting for its outcome
///
/// Every observer (stdout, stderr, exit watcher) reports through the same
/// channel and `start` acts on whichever signal it receives first.
/// Signals sent after `close` are refused so the caller can fall back to
/// the post-startup handling.
#[derive(Clone)]
struct StartupGate {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<StartupSignal>>>>,
}

impl StartupGate {
    fn open() -> (Self, mpsc::UnboundedReceiver<StartupSignal>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let gate = Self {
            sender: Arc::new(Mutex::new(Some(sender))),
        };
        (gate, receiver)
    }

    fn lock(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<StartupSignal>>> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.sender.lock().unwrap()
    }

    fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Deliver `signal` if the gate is still open
    fn signal(&self, signal: StartupSignal) -> bool {
        match self.lock().as_ref() {
            Some(sender) => sender.send(signal).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        self.lock().take();
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Handle to a supervised child tool process
///
/// Cheap to clone; all clones drive the same child.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    config: SupervisorConfig,
    registry: RequestRegistry,
    events: broadcast::Sender<SupervisorEvent>,
    status: Mutex<SupervisorStatus>,

    /// Serializes start, stop and restart attempts
    lifecycle: tokio::sync::Mutex<()>,

    process: Mutex<Option<RunningProcess>>,
    policy: Mutex<RestartPolicy>,

    /// Incremented per spawn; exits carry the generation they belong to
    generation: AtomicU64,

    /// Set while a restart loop owns crash recovery
    restarting: AtomicBool,

    /// Cancelled by `stop`; renewed by `start`
    cancel: Mutex<CancellationToken>,

    stability_task: Mutex<Option<JoinHandle<()>>>,
    classifier: StderrClassifier,
    ready: ReadyDetector,
}

/// The child currently owned by the supervisor
struct RunningProcess {
    manager: ChildProcessManager,
    writer: StdinWriter,
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningProcess {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = SupervisorInner {
            registry: RequestRegistry::new(config.request_timeout),
            policy: Mutex::new(RestartPolicy::new(config.restart)),
            ready: ReadyDetector::new(config.ready_markers.clone()),
            classifier: StderrClassifier::new(),
            config,
            events,
            status: Mutex::new(SupervisorStatus::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            process: Mutex::new(None),
            generation: AtomicU64::new(0),
            restarting: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            stability_task: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    /// Start the child and wait until it is ready
    ///
    /// No-op if already running. Fails with `AlreadyStarting` while another
    /// start, stop or restart attempt holds the lifecycle.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let inner = &self.inner;
        let _lifecycle = inner
            .lifecycle
            .try_lock()
            .map_err(|_| SupervisorError::AlreadyStarting)?;

        if inner.process_slot().is_some() {
            info!("Mail tool already running, start ignored");
            return Ok(());
        }

        inner.renew_cancel_token();
        inner.restarting.store(false, Ordering::SeqCst);
        inner.policy().reset();

        let token = inner.cancel_token();
        match inner.start_inner(&token).await {
            Ok(pid) => {
                info!("Mail tool started (PID {})", pid);
                Ok(())
            }
            Err(e) => {
                error!(kind = e.kind(), "Failed to start mail tool: {}", e);
                inner.status().record_error(e.to_string());
                Err(e)
            }
        }
    }

    /// Stop the child, escalating to SIGKILL if it ignores SIGTERM
    ///
    /// Rejects all pending requests and cancels any scheduled restart. A
    /// start or restart still waiting for readiness is abandoned and its
    /// child killed. Idempotent.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let inner = &self.inner;
        inner.cancel_token().cancel();
        inner.abort_stability_task();

        let _lifecycle = inner.lifecycle.lock().await;
        inner.restarting.store(false, Ordering::SeqCst);

        let taken = inner.process_slot().take();
        let rejected = inner.registry.clear(RpcError::ShuttingDown);

        let Some(mut running) = taken else {
            debug!("Stop requested but mail tool is not running");
            inner.status().mark_stopped();
            return Ok(());
        };

        info!(
            "Stopping mail tool (PID {:?}), {} pending request(s) rejected",
            running.manager.pid(),
            rejected
        );
        let started = Instant::now();

        inner.shutdown_process(&mut running).await;
        running.abort_tasks();

        inner.status().mark_stopped();
        inner.emit(SupervisorEvent::Stopped);
        crate::log_timing!(Level::INFO, "mail_tool_stop", started.elapsed());
        Ok(())
    }

    /// Send a request using the configured timeout
    pub async fn send_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.inner.send(method, params, None).await
    }

    /// Send a request with an explicit timeout
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        self.inner.send(method, params, Some(timeout)).await
    }

    pub fn is_running(&self) -> bool {
        self.inner.status().running
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.status().pid
    }

    /// Status snapshot with uptime computed now
    pub fn status(&self) -> StatusSnapshot {
        let inner = &self.inner;
        let pending = inner.registry.len();
        let stdin_backlog_bytes = inner
            .process_slot()
            .as_ref()
            .map_or(0, |running| running.writer.backlog());
        let (restart_state, restart_attempts) = self.restart_state();

        StatusSnapshot {
            stdin_backlog_bytes,
            restart_state,
            restart_attempts,
            ..inner.status().snapshot(pending, inner.config.port)
        }
    }

    /// In-flight requests, oldest first
    pub fn pending_requests(&self) -> Vec<PendingInfo> {
        self.inner.registry.snapshot()
    }

    /// Restart policy state and attempts since the last reset
    pub fn restart_state(&self) -> (RestartState, u32) {
        let policy = self.inner.policy();
        (policy.state(), policy.attempts())
    }
}

impl SupervisorInner {
    fn status(&self) -> MutexGuard<'_, SupervisorStatus> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.status.lock().unwrap()
    }

    fn process_slot(&self) -> MutexGuard<'_, Option<RunningProcess>> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.process.lock().unwrap()
    }

    fn policy(&self) -> MutexGuard<'_, RestartPolicy> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.policy.lock().unwrap()
    }

    fn cancel_token(&self) -> CancellationToken {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.cancel.lock().unwrap().clone()
    }

    fn renew_cancel_token(&self) {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let mut token = self.cancel.lock().unwrap();
        token.cancel();
        *token = CancellationToken::new();
    }

    fn abort_stability_task(&self) {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        if let Some(task) = self.stability_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        trace!("Supervisor event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Remove the running process if it belongs to `generation`
    fn take_process(&self, generation: u64) -> Option<RunningProcess> {
        let mut slot = self.process_slot();
        match slot.as_ref() {
            Some(running) if running.generation == generation => slot.take(),
            _ => None,
        }
    }

    // ------------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------------

    /// Spawn, wait for readiness, handshake; caller holds the lifecycle lock
    ///
    /// Cancelling `token` abandons the start and tears the child down.
    async fn start_inner(
        self: &Arc<Self>,
        token: &CancellationToken,
    ) -> Result<u32, SupervisorError> {
        let config = &self.config;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + config.startup_timeout;

        info!(
            "Starting mail tool: {} {:?} (port: {:?}, generation {})",
            config.command, config.args, config.port, generation
        );

        let (gate, mut signals) = StartupGate::open();

        let mut manager = ChildProcessManager::new(
            config.command.clone(),
            config.args.clone(),
            config.working_directory.clone(),
        )
        .with_env(config.child_env());
        manager.on_stderr_line(self.stderr_handler(gate.clone()));
        manager.on_process_exit(Arc::new(ExitWatcher {
            inner: Arc::downgrade(self),
            generation,
            gate: gate.clone(),
        }));

        if let Err(e) = manager.start().await {
            gate.close();
            return Err(SupervisorError::from_spawn(&config.command, e));
        }
        let pid = manager.pid().unwrap_or_default();

        let transport = match manager.create_stdio_transport() {
            Ok(transport) => transport,
            Err(e) => {
                gate.close();
                manager.kill_sync();
                return Err(e.into());
            }
        };
        let (writer, reader, write_failure) = transport.into_split();

        let tasks = vec![
            tokio::spawn(read_stdout(
                Arc::downgrade(self),
                self.registry.clone(),
                self.events.clone(),
                reader,
                gate.clone(),
                self.ready.clone(),
            )),
            tokio::spawn(watch_write_failure(Arc::downgrade(self), write_failure)),
        ];
        let running = RunningProcess {
            manager,
            writer,
            generation,
            tasks,
        };

        let ready = tokio::select! {
            _ = token.cancelled() => Err(SupervisorError::StartCancelled),
            ready = tokio::time::timeout_at(deadline, self.await_ready(&mut signals, &running)) => {
                ready.unwrap_or_else(|_| {
                    Err(SupervisorError::StartupTimeout {
                        timeout: config.startup_timeout,
                    })
                })
            }
        };
        if let Err(e) = ready {
            gate.close();
            self.teardown(running);
            return Err(e);
        }

        *self.process_slot() = Some(running);

        if let Some(handshake) = &config.handshake {
            let result = tokio::select! {
                _ = token.cancelled() => Err(SupervisorError::StartCancelled),
                result = tokio::time::timeout_at(deadline, self.handshake(handshake, &mut signals)) => {
                    result.unwrap_or_else(|_| {
                        Err(SupervisorError::StartupTimeout {
                            timeout: config.startup_timeout,
                        })
                    })
                }
            };
            if let Err(e) = result {
                // Take before closing so a concurrent exit is not seen as a crash
                let running = self.take_process(generation);
                gate.close();
                if let Some(running) = running {
                    self.teardown(running);
                }
                return Err(e);
            }
        }

        self.status().mark_running(pid);
        self.emit(SupervisorEvent::Started { pid });
        self.restarting.store(false, Ordering::SeqCst);
        gate.close();

        // An exit that raced the close is a crash of a started process
        while let Ok(signal) = signals.try_recv() {
            if let StartupSignal::Exited(event) = signal {
                self.handle_exit(generation, event);
            }
        }

        crate::log_timing!(Level::INFO, "mail_tool_start", started.elapsed());
        Ok(pid)
    }

    /// Wait for the first startup signal or the ready fallback
    async fn await_ready(
        &self,
        signals: &mut mpsc::UnboundedReceiver<StartupSignal>,
        running: &RunningProcess,
    ) -> Result<(), SupervisorError> {
        let fallback = async {
            match self.config.ready_fallback {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            signal = signals.recv() => interpret_signal(signal),
            _ = fallback => {
                if running.manager.is_running() {
                    info!(
                        "No ready signal after {:?} but the process is alive, assuming ready",
                        self.config.ready_fallback
                    );
                    Ok(())
                } else {
                    match signals.try_recv() {
                        Ok(signal) => interpret_signal(Some(signal)),
                        Err(_) => Err(SupervisorError::ExitedDuringStartup { code: None, signal: None }),
                    }
                }
            }
        }
    }

    /// Send the handshake while still watching for startup failures
    async fn handshake(
        &self,
        handshake: &Handshake,
        signals: &mut mpsc::UnboundedReceiver<StartupSignal>,
    ) -> Result<(), SupervisorError> {
        debug!("Sending handshake request: {}", handshake.method);
        let request = self.send(&handshake.method, handshake.params.clone(), None);
        tokio::pin!(request);

        loop {
            tokio::select! {
                result = &mut request => {
                    return result.map(|_| ()).map_err(SupervisorError::Handshake);
                }
                signal = signals.recv() => {
                    // Late ready markers are harmless; anything else ends the start
                    interpret_signal(signal)?;
                }
            }
        }
    }

    /// Kill a process that failed to start and drop everything it owned
    fn teardown(&self, mut running: RunningProcess) {
        debug!(
            "Tearing down failed start (PID {:?}, generation {})",
            running.manager.pid(),
            running.generation
        );
        running.abort_tasks();
        if running.manager.is_running() {
            running.manager.kill_sync();
        }
        self.registry.clear(RpcError::ServiceStopped {
            reason: "startup failed".to_string(),
        });
    }

    fn stderr_handler(self: &Arc<Self>, gate: StartupGate) -> impl Fn(String) + Send + Sync + 'static {
        let inner = Arc::downgrade(self);
        let classifier = self.classifier.clone();
        let ready = self.ready.clone();
        let port = self.config.port;

        move |line: String| {
            let class = classifier.classify_and_log(&line);

            if class.is_fatal_during_startup() {
                let fatal = match class {
                    LineClass::PortConflict => SupervisorError::PortConflict {
                        port,
                        line: line.clone(),
                    },
                    LineClass::Authentication => SupervisorError::AuthenticationFailure {
                        line: line.clone(),
                    },
                    _ => SupervisorError::MissingDependency { line: line.clone() },
                };
                if gate.signal(StartupSignal::Fatal(fatal)) {
                    return;
                }

                // After startup these are reported but do not stop the process
                let kind = match class {
                    LineClass::Authentication => ErrorKind::AuthenticationLost,
                    LineClass::PortConflict => ErrorKind::PortConflict,
                    _ => ErrorKind::MissingDependency,
                };
                if let Some(inner) = inner.upgrade() {
                    warn!("Mail tool reported {} while running: {}", kind, line);
                    inner.status().record_error(line.clone());
                    inner.emit(SupervisorEvent::Error {
                        kind,
                        message: line,
                    });
                }
                return;
            }

            if gate.is_open()
                && let Some(marker) = ready.detect(&line)
            {
                gate.signal(StartupSignal::Ready {
                    marker: marker.to_string(),
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Write one request and wait for its outcome; `None` uses the configured timeout
    async fn send(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let writer = match self.process_slot().as_ref() {
            Some(running) => running.writer.clone(),
            None => return Err(RpcError::NotRunning),
        };
        if writer.is_closed() {
            return Err(RpcError::StdinUnavailable);
        }

        let id = generate_request_id(method);
        let line = JsonRpcRequest::new(id.clone(), method, params.clone()).to_line()?;
        let response = match timeout {
            Some(timeout) => self
                .registry
                .register_with_timeout(id.clone(), method, params, timeout)?,
            None => self.registry.register(id.clone(), method, params)?,
        };
        self.status().request_count += 1;

        match writer.write(line) {
            Ok(WriteOutcome::Queued) => {}
            Ok(WriteOutcome::Backpressure { backlog_bytes }) => {
                warn!(
                    "Mail tool stdin is lagging: {} byte(s) queued (request {})",
                    backlog_bytes, id
                );
                self.status().backpressure_events += 1;
            }
            Err(e) => {
                self.registry.remove(&id);
                self.status()
                    .record_error(format!("Failed to write {method} request: {e}"));
                return Err(RpcError::Write(e.to_string()));
            }
        }

        crate::log_rpc_message!(Level::DEBUG, "outgoing", method, &id);
        self.emit(SupervisorEvent::Request {
            id: id.clone(),
            method: method.to_string(),
        });

        match response.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                if matches!(error, RpcError::Timeout { .. }) {
                    self.status().record_error(error.to_string());
                }
                Err(error)
            }
            Err(_) => Err(RpcError::ServiceStopped {
                reason: format!("request {id} was abandoned"),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Exit and restart
    // ------------------------------------------------------------------------

    /// React to the exit of a started process
    fn handle_exit(self: &Arc<Self>, generation: u64, event: ProcessExitEvent) {
        let Some(running) = self.take_process(generation) else {
            debug!(
                "Ignoring exit from generation {} ({}): not the current process",
                generation, event
            );
            return;
        };
        // Reader tasks end on their own at EOF
        drop(running);

        self.abort_stability_task();
        self.status().mark_stopped();

        if event.is_success() {
            info!("Mail tool exited cleanly");
            self.registry.clear(RpcError::ServiceStopped {
                reason: "mail tool exited".to_string(),
            });
            self.emit(SupervisorEvent::Stopped);
            return;
        }

        error!("Mail tool crashed: {}", event);
        self.status()
            .record_error(format!("Mail tool crashed: {event}"));
        self.registry.clear(RpcError::ServiceStopped {
            reason: format!("mail tool crashed ({event})"),
        });
        self.emit(SupervisorEvent::Crashed {
            code: event.code,
            signal: event.signal,
        });

        let token = self.cancel_token();
        if token.is_cancelled() {
            debug!("Stop in progress, not restarting");
            return;
        }
        if self.restarting.swap(true, Ordering::SeqCst) {
            debug!("Restart loop already active");
            return;
        }
        tokio::spawn(restart_loop(Arc::clone(self), token));
    }

    /// Reset the restart counter once `generation` has run for the stability window
    fn schedule_stability_reset(self: &Arc<Self>, generation: u64) {
        let inner = Arc::downgrade(self);
        let window = self.policy().stability_window();

        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let still_current = inner
                .process_slot()
                .as_ref()
                .is_some_and(|running| running.generation == generation);
            if still_current {
                info!("Mail tool stable for {:?}, restart counter reset", window);
                inner.policy().on_stable();
            }
        });

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        if let Some(previous) = self.stability_task.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    // ------------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------------

    async fn shutdown_process(&self, running: &mut RunningProcess) {
        let id = format!("shutdown-{}", chrono::Utc::now().timestamp_millis());
        match JsonRpcRequest::new(id, "shutdown", json!({})).to_line() {
            Ok(line) => {
                if let Err(e) = running.writer.write(line) {
                    debug!("Could not send shutdown request: {}", e);
                }
            }
            Err(e) => debug!("Could not encode shutdown request: {}", e),
        }

        if let Some(event) = running
            .manager
            .wait_for_exit(self.config.shutdown_grace)
            .await
        {
            info!("Mail tool exited after shutdown request ({})", event);
            return;
        }

        if let Err(e) = running.manager.stop(StopMode::Graceful).await {
            debug!("SIGTERM not delivered: {}", e);
        }
        if let Some(event) = running.manager.wait_for_exit(self.config.kill_grace).await {
            info!("Mail tool exited after SIGTERM ({})", event);
            return;
        }

        warn!(
            "Mail tool did not exit within {:?} of SIGTERM, killing",
            self.config.kill_grace
        );
        if let Err(e) = running.manager.stop(StopMode::Force).await {
            debug!("SIGKILL not delivered: {}", e);
        }
        if running
            .manager
            .wait_for_exit(FORCE_KILL_REAP_TIMEOUT)
            .await
            .is_none()
        {
            error!("Mail tool still not reaped after SIGKILL");
        }
    }
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        if let Ok(slot) = self.process.get_mut()
            && let Some(mut running) = slot.take()
        {
            running.abort_tasks();
            running.manager.kill_sync();
        }
        if let Ok(task) = self.stability_task.get_mut()
            && let Some(task) = task.take()
        {
            task.abort();
        }
    }
}

fn interpret_signal(signal: Option<StartupSignal>) -> Result<(), SupervisorError> {
    match signal {
        Some(StartupSignal::Ready { marker }) => {
            debug!("Ready signal received: {:?}", marker);
            Ok(())
        }
        Some(StartupSignal::Fatal(error)) => Err(error),
        Some(StartupSignal::Exited(event)) => Err(SupervisorError::ExitedDuringStartup {
            code: event.code,
            signal: event.signal,
        }),
        None => Err(SupervisorError::ExitedDuringStartup {
            code: None,
            signal: None,
        }),
    }
}

/// Single authoritative crash-recovery loop
async fn restart_loop(inner: Arc<SupervisorInner>, token: CancellationToken) {
    loop {
        let decision = inner.policy().on_crash();

        let (attempt, delay) = match decision {
            RestartDecision::GiveUp { attempts } => {
                error!(
                    "Mail tool failed permanently after {} restart attempt(s)",
                    attempts
                );
                inner
                    .status()
                    .record_error(SupervisorError::PermanentFailure { attempts }.to_string());
                inner.emit(SupervisorEvent::PermanentFailure { attempts });
                inner.restarting.store(false, Ordering::SeqCst);
                return;
            }
            RestartDecision::Restart { attempt, delay } => (attempt, delay),
        };

        warn!(
            "Restarting mail tool in {:?} (attempt {}/{})",
            delay, attempt, inner.config.restart.max_attempts
        );
        inner.status().restart_count += 1;
        inner.emit(SupervisorEvent::Restarting { attempt, delay });

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let _lifecycle = inner.lifecycle.lock().await;
        if token.is_cancelled() {
            return;
        }
        if inner.process_slot().is_some() {
            debug!("Mail tool already running, restart attempt dropped");
            inner.restarting.store(false, Ordering::SeqCst);
            return;
        }

        match inner.start_inner(&token).await {
            Ok(pid) => {
                info!("Mail tool restarted (PID {}, attempt {})", pid, attempt);
                let generation = inner.generation.load(Ordering::SeqCst);
                inner.schedule_stability_reset(generation);
                return;
            }
            Err(SupervisorError::StartCancelled) => {
                info!("Restart attempt {} abandoned by stop", attempt);
                return;
            }
            Err(e) => {
                error!("Restart attempt {} failed: {}", attempt, e);
                inner.status().record_error(e.to_string());
                inner.emit(SupervisorEvent::Error {
                    kind: ErrorKind::RestartFailed,
                    message: e.to_string(),
                });
            }
        }
    }
}

/// Frame stdout, dispatch responses, watch for the ready marker
async fn read_stdout(
    inner: Weak<SupervisorInner>,
    registry: RequestRegistry,
    events: broadcast::Sender<SupervisorEvent>,
    mut reader: StdoutReader,
    gate: StartupGate,
    ready: ReadyDetector,
) {
    let mut framer = LineFramer::new();
    let mut overflows_seen = 0;

    while let Some(chunk) = reader.next_chunk().await {
        if gate.is_open()
            && let Some(marker) = ready.detect(&chunk)
        {
            gate.signal(StartupSignal::Ready {
                marker: marker.to_string(),
            });
        }

        for line in framer.push(&chunk) {
            match dispatch_line(&line, &registry) {
                DispatchOutcome::Resolved { id } => {
                    crate::log_rpc_message!(Level::DEBUG, "incoming", "result", &id);
                    let _ = events.send(SupervisorEvent::Response { id, success: true });
                }
                DispatchOutcome::Rejected { id } => {
                    crate::log_rpc_message!(Level::DEBUG, "incoming", "error", &id);
                    let _ = events.send(SupervisorEvent::Response { id, success: false });
                }
                DispatchOutcome::Unmatched { .. } | DispatchOutcome::ParseError => {
                    if let Some(inner) = inner.upgrade() {
                        inner.status().protocol_errors += 1;
                    }
                }
                DispatchOutcome::Notification { .. } | DispatchOutcome::Ignored => {}
            }
        }

        // Oversized fragments were discarded by the framer
        let overflows = framer.overflows();
        if overflows > overflows_seen {
            if let Some(inner) = inner.upgrade() {
                inner.status().protocol_errors += overflows - overflows_seen;
            }
            overflows_seen = overflows;
        }
    }

    if framer.pending_len() > 0 {
        debug!(
            "Discarding {} byte(s) of unterminated mail tool output",
            framer.pending_len()
        );
    }
    trace!("Mail tool stdout closed");
}

async fn watch_write_failure(
    inner: Weak<SupervisorInner>,
    failure: oneshot::Receiver<std::io::Error>,
) {
    let Ok(error) = failure.await else {
        return;
    };
    warn!("Writing to mail tool stdin failed: {}", error);
    if let Some(inner) = inner.upgrade() {
        let message = format!("stdin write failed: {error}");
        inner.status().record_error(message.clone());
        // Nothing queued after the failure reaches the child
        let rejected = inner.registry.clear(RpcError::ServiceStopped {
            reason: message.clone(),
        });
        debug!("{} pending request(s) rejected after stdin failure", rejected);
        inner.emit(SupervisorEvent::Error {
            kind: ErrorKind::Transport,
            message,
        });
    }
}

/// Routes the child's exit to the startup gate or the crash path
struct ExitWatcher {
    inner: Weak<SupervisorInner>,
    generation: u64,
    gate: StartupGate,
}

#[async_trait]
impl ProcessExitHandler for ExitWatcher {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        if self.gate.signal(StartupSignal::Exited(event)) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_exit(self.generation, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::config::SupervisorConfigBuilder;
    use crate::test_utils::scripts::{ECHO_SERVER, sh};
    use tokio::sync::broadcast::error::RecvError;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    fn supervisor(builder: SupervisorConfigBuilder) -> ProcessSupervisor {
        ProcessSupervisor::new(builder.build().unwrap())
    }

    /// Collect events until `done` matches one, failing after 10 seconds
    async fn events_until<F>(
        rx: &mut broadcast::Receiver<SupervisorEvent>,
        done: F,
    ) -> Vec<SupervisorEvent>
    where
        F: Fn(&SupervisorEvent) -> bool,
    {
        let mut seen = Vec::new();
        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let stop = done(&event);
                        seen.push(event);
                        if stop {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
        })
        .await;
        assert!(finished.is_ok(), "timed out waiting for event, saw {seen:?}");
        seen
    }

    fn spawn_counter() -> (tempfile::NamedTempFile, String) {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().display().to_string();
        (file, path)
    }

    fn spawn_count(file: &tempfile::NamedTempFile) -> usize {
        std::fs::read_to_string(file.path()).unwrap().lines().count()
    }

    #[tokio::test]
    async fn test_start_request_stop() {
        let supervisor = supervisor(sh(ECHO_SERVER));
        let mut events = supervisor.subscribe();

        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        assert!(supervisor.pid().is_some());
        assert!(matches!(events.recv().await.unwrap(), SupervisorEvent::Started { .. }));

        let result = supervisor
            .send_request("tools/call", json!({"tag": "hello"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"echo": "hello"}));

        let status = supervisor.status();
        assert_eq!(status.request_count, 1);
        assert_eq!(status.pending_requests, 0);
        assert!(status.uptime_ms.is_some());

        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running());
        events_until(&mut events, |e| *e == SupervisorEvent::Stopped).await;

        // Idempotent
        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_start_when_running_is_noop() {
        let supervisor = supervisor(sh(ECHO_SERVER));
        supervisor.start().await.unwrap();
        let pid = supervisor.pid();
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.pid(), pid);
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_timeout_without_ready_signal() {
        let supervisor = supervisor(sh("sleep 5").startup_timeout(Duration::from_millis(50)));

        let started = Instant::now();
        let result = supervisor.start().await;
        let elapsed = started.elapsed();

        assert!(
            matches!(result, Err(SupervisorError::StartupTimeout { .. })),
            "{result:?}"
        );
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
        assert!(!supervisor.is_running());
        assert!(supervisor.status().last_error.is_some());
    }

    #[tokio::test]
    async fn test_ready_fallback_when_alive() {
        let supervisor =
            supervisor(sh("sleep 5").ready_fallback(Some(Duration::from_millis(100))));
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_during_startup() {
        let supervisor = supervisor(sh("exit 3"));
        match supervisor.start().await {
            Err(SupervisorError::ExitedDuringStartup { code, .. }) => assert_eq!(code, Some(3)),
            other => panic!("expected exit during startup, got {other:?}"),
        }
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let supervisor = ProcessSupervisor::new(
            SupervisorConfig::builder("definitely-not-a-real-mail-tool-xyz")
                .build()
                .unwrap(),
        );
        let error = supervisor.start().await.unwrap_err();
        assert!(matches!(error, SupervisorError::SpawnFailure { .. }));
        assert!(error.hint().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_port_is_passed_in_environment() {
        let script = r#"[ "$PORT" = "4321" ] && [ "$MCP_PORT" = "4321" ] && echo "MCP server running"; sleep 5"#;
        let supervisor = supervisor(
            sh(script)
                .port(4321)
                .startup_timeout(Duration::from_secs(2)),
        );
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.status().port, Some(4321));
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_authentication_failure_on_stderr_rejects_start() {
        let supervisor = supervisor(sh(
            "echo 'ERROR Authentication failed: invalid_grant' >&2; sleep 5",
        ));
        let result = supervisor.start().await;
        assert!(
            matches!(result, Err(SupervisorError::AuthenticationFailure { .. })),
            "{result:?}"
        );
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_port_conflict_on_stderr_rejects_start() {
        let supervisor = supervisor(
            sh("echo 'OSError: [Errno 98] address already in use' >&2; sleep 5").port(3999),
        );
        match supervisor.start().await {
            Err(SupervisorError::PortConflict { port, .. }) => assert_eq!(port, Some(3999)),
            other => panic!("expected port conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_while_not_running_rejects_immediately() {
        let supervisor = supervisor(sh(ECHO_SERVER));
        let result = supervisor.send_request("tools/list", json!({})).await;
        assert!(matches!(result, Err(RpcError::NotRunning)));

        let status = supervisor.status();
        assert_eq!(status.pending_requests, 0);
        assert_eq!(status.request_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_answered_in_reverse_order() {
        let script = r#"echo "MCP server running"
read -r l1; read -r l2; read -r l3
reply() {
  id=$(printf '%s' "$1" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  tag=$(printf '%s' "$1" | sed -n 's/.*"tag":"\([^"]*\)".*/\1/p')
  printf '{"jsonrpc":"2.0","result":"%s","id":"%s"}' "$tag" "$id"
}
r1=$(reply "$l1"); r2=$(reply "$l2"); r3=$(reply "$l3")
printf '%s\n%s\n%s\n' "$r3" "$r2" "$r1"
sleep 5"#;
        let supervisor = supervisor(sh(script));
        supervisor.start().await.unwrap();

        let (a, b, c) = tokio::join!(
            supervisor.send_request("m", json!({"tag": "a"})),
            supervisor.send_request("m", json!({"tag": "b"})),
            supervisor.send_request("m", json!({"tag": "c"})),
        );
        assert_eq!(a.unwrap(), json!("a"));
        assert_eq!(b.unwrap(), json!("b"));
        assert_eq!(c.unwrap(), json!("c"));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout_then_late_response() {
        let script = r#"echo "MCP server running"
read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
sleep 0.3
printf '{"jsonrpc":"2.0","result":"late","id":"%s"}\n' "$id"
sleep 5"#;
        let supervisor = supervisor(sh(script));
        supervisor.start().await.unwrap();

        let result = supervisor
            .send_request_with_timeout("slow/method", json!({}), Duration::from_millis(100))
            .await;
        match result {
            Err(RpcError::Timeout { method, id, .. }) => {
                assert_eq!(method, "slow/method");
                assert!(id.starts_with("slow/method-"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = supervisor.status();
        assert_eq!(status.pending_requests, 0);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.protocol_errors, 1);
        assert!(supervisor.is_running());

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_rejects_request() {
        let script = r#"echo "MCP server running"
read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
printf '{"jsonrpc":"2.0","error":{"code":-32601,"message":"Unknown tool"},"id":"%s"}\n' "$id"
sleep 5"#;
        let supervisor = supervisor(sh(script));
        supervisor.start().await.unwrap();

        match supervisor.send_request("tools/call", json!({})).await {
            Err(RpcError::Server { code, message, .. }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Unknown tool");
            }
            other => panic!("expected server error, got {other:?}"),
        }
        assert!(supervisor.is_running());
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_rejects_pending_and_restarts() {
        let (counter, path) = spawn_counter();
        let script = format!(
            r#"echo x >> '{path}'
echo "MCP server running"
read -r line
exit 1"#
        );
        let supervisor = supervisor(sh(&script));
        let mut events = supervisor.subscribe();
        supervisor.start().await.unwrap();

        let result = supervisor.send_request("tools/call", json!({})).await;
        assert!(
            matches!(result, Err(RpcError::ServiceStopped { .. })),
            "{result:?}"
        );

        let seen = events_until(&mut events, |e| {
            matches!(e, SupervisorEvent::Started { .. })
                && spawn_count(&counter) == 2
        })
        .await;
        assert!(seen.iter().any(|e| matches!(
            e,
            SupervisorEvent::Crashed {
                code: Some(1),
                ..
            }
        )));
        assert!(seen.iter().any(|e| matches!(
            e,
            SupervisorEvent::Restarting { attempt: 1, .. }
        )));
        assert!(supervisor.is_running());
        assert_eq!(supervisor.status().restart_count, 1);

        supervisor.stop().await.unwrap();
        assert_eq!(spawn_count(&counter), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_after_restart_budget() {
        let (counter, path) = spawn_counter();
        let script = format!(
            r#"echo x >> '{path}'
echo "MCP server running"
sleep 0.2
exit 1"#
        );
        let supervisor = supervisor(sh(&script).restart_attempts(2));
        let mut events = supervisor.subscribe();
        supervisor.start().await.unwrap();

        let seen = events_until(&mut events, |e| {
            matches!(e, SupervisorEvent::PermanentFailure { .. })
        })
        .await;

        let crashes = seen
            .iter()
            .filter(|e| matches!(e, SupervisorEvent::Crashed { .. }))
            .count();
        let delays: Vec<Duration> = seen
            .iter()
            .filter_map(|e| match e {
                SupervisorEvent::Restarting { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect();

        assert_eq!(crashes, 3);
        assert_eq!(delays.len(), 2);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(40)));
        assert_eq!(
            seen.last(),
            Some(&SupervisorEvent::PermanentFailure { attempts: 2 })
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(spawn_count(&counter), 3);
        assert!(!supervisor.is_running());
        assert_eq!(
            supervisor.restart_state(),
            (RestartState::PermanentlyFailed, 2)
        );
    }

    #[tokio::test]
    async fn test_stop_during_restart_abandons_the_pending_start() {
        let (counter, path) = spawn_counter();
        let script = format!(
            r#"echo x >> '{path}'
spawns=$(wc -l < '{path}')
if [ $spawns -eq 1 ]; then
  echo "MCP server running"
  sleep 0.2
  exit 1
fi
sleep 30"#
        );
        let supervisor = supervisor(sh(&script).startup_timeout(Duration::from_secs(4)));
        let mut events = supervisor.subscribe();
        supervisor.start().await.unwrap();

        events_until(&mut events, |e| matches!(e, SupervisorEvent::Restarting { .. })).await;
        let respawned = tokio::time::timeout(Duration::from_secs(2), async {
            while spawn_count(&counter) < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(respawned.is_ok(), "restart never spawned a second process");

        let started = Instant::now();
        supervisor.stop().await.unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_secs(2), "stop took {elapsed:?}");
        assert!(!supervisor.is_running());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(spawn_count(&counter), 2);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_clean_exit_does_not_restart() {
        let (counter, path) = spawn_counter();
        let script = format!(
            r#"echo x >> '{path}'
echo "MCP server running"
sleep 0.2
exit 0"#
        );
        let supervisor = supervisor(sh(&script));
        let mut events = supervisor.subscribe();
        supervisor.start().await.unwrap();

        let seen = events_until(&mut events, |e| *e == SupervisorEvent::Stopped).await;
        assert!(!seen.iter().any(|e| matches!(e, SupervisorEvent::Crashed { .. })));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(spawn_count(&counter), 1);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_force_kills_and_rejects_pending() {
        let script = r#"trap '' TERM
echo "MCP server running"
while true; do sleep 0.1; done"#;
        let supervisor = supervisor(sh(script).kill_grace(Duration::from_millis(300)));
        supervisor.start().await.unwrap();

        let pending = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.send_request("never/answered", json!({})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.status().pending_requests, 1);
        let pending_requests = supervisor.pending_requests();
        assert_eq!(pending_requests.len(), 1);
        assert_eq!(pending_requests[0].method, "never/answered");
        assert!(pending_requests[0].id.starts_with("never/answered-"));

        let started = Instant::now();
        supervisor.stop().await.unwrap();
        assert!(!supervisor.is_running());
        assert!(started.elapsed() < Duration::from_secs(3));

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(RpcError::ShuttingDown)), "{result:?}");
    }

    #[tokio::test]
    async fn test_stdin_failure_rejects_pending_requests() {
        let script = r#"exec 0<&-
echo "MCP server running"
sleep 5"#;
        let supervisor = supervisor(sh(script));
        let mut events = supervisor.subscribe();
        supervisor.start().await.unwrap();

        let started = Instant::now();
        let result = supervisor
            .send_request_with_timeout("tools/call", json!({}), Duration::from_secs(3))
            .await;
        match result {
            Err(RpcError::ServiceStopped { reason }) => {
                assert!(reason.contains("stdin write failed"), "{reason}")
            }
            other => panic!("expected service stopped, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        events_until(&mut events, |e| {
            matches!(
                e,
                SupervisorEvent::Error {
                    kind: ErrorKind::Transport,
                    ..
                }
            )
        })
        .await;
        assert_eq!(supervisor.status().pending_requests, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            supervisor.send_request("tools/list", json!({})).await,
            Err(RpcError::StdinUnavailable)
        ));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reports_restart_state() {
        let supervisor = supervisor(sh(ECHO_SERVER));
        supervisor.start().await.unwrap();

        let status = supervisor.status();
        assert_eq!(status.restart_state, RestartState::Stable);
        assert_eq!(status.restart_attempts, 0);
        assert_eq!(status.stdin_backlog_bytes, 0);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_loss_after_startup_is_reported_not_fatal() {
        let script = r#"echo "MCP server running"
sleep 0.2
echo "GMAIL_AUTH_LOST: refresh token revoked" >&2
sleep 5"#;
        let supervisor = supervisor(sh(script));
        let mut events = supervisor.subscribe();
        supervisor.start().await.unwrap();

        events_until(&mut events, |e| {
            matches!(
                e,
                SupervisorEvent::Error {
                    kind: ErrorKind::AuthenticationLost,
                    ..
                }
            )
        })
        .await;
        assert!(supervisor.is_running());
        assert!(supervisor.status().last_error.unwrap().contains("GMAIL_AUTH_LOST"));

        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_runs_before_start_returns() {
        let supervisor = supervisor(sh(ECHO_SERVER).handshake("initialize", json!({"tag": "hi"})));
        supervisor.start().await.unwrap();
        assert_eq!(supervisor.status().request_count, 1);
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_handshake_tears_down() {
        let script = r#"echo "MCP server running"
read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
printf '{"jsonrpc":"2.0","error":{"code":-32602,"message":"bad protocol"},"id":"%s"}\n' "$id"
sleep 5"#;
        let supervisor = supervisor(sh(script).handshake("initialize", json!({})));
        match supervisor.start().await {
            Err(SupervisorError::Handshake(RpcError::Server { code, .. })) => {
                assert_eq!(code, -32602)
            }
            other => panic!("expected handshake failure, got {other:?}"),
        }
        assert!(!supervisor.is_running());
        assert!(matches!(
            supervisor.send_request("x", json!({})).await,
            Err(RpcError::NotRunning)
        ));
    }
}
