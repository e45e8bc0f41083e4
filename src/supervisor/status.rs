//! Supervisor status
//!
//! Counters and process facts mutated only by the supervisor. Readers get a
//! snapshot; uptime is computed when the snapshot is taken.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

use crate::supervisor::restart::RestartState;

/// Live status owned by the supervisor
#[derive(Debug, Clone, Default)]
pub struct SupervisorStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub started_at: Option<Instant>,
    pub request_count: u64,
    pub error_count: u64,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub backpressure_events: u64,
    pub protocol_errors: u64,
}

impl SupervisorStatus {
    pub fn mark_running(&mut self, pid: u32) {
        self.running = true;
        self.pid = Some(pid);
        self.start_time = Some(Utc::now());
        self.started_at = Some(Instant::now());
    }

    pub fn mark_stopped(&mut self) {
        self.running = false;
        self.pid = None;
        self.started_at = None;
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.error_count += 1;
        self.last_error = Some(message.into());
    }

    pub fn snapshot(&self, pending_requests: usize, port: Option<u16>) -> StatusSnapshot {
        StatusSnapshot {
            running: self.running,
            pid: self.pid,
            start_time: self.start_time,
            uptime_ms: self
                .started_at
                .filter(|_| self.running)
                .map(|started| started.elapsed().as_millis() as u64),
            request_count: self.request_count,
            error_count: self.error_count,
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
            pending_requests,
            backpressure_events: self.backpressure_events,
            protocol_errors: self.protocol_errors,
            port,
            stdin_backlog_bytes: 0,
            restart_state: RestartState::Stable,
            restart_attempts: 0,
        }
    }
}

/// Point-in-time copy handed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: bool,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub uptime_ms: Option<u64>,
    pub request_count: u64,
    pub error_count: u64,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub pending_requests: usize,
    pub backpressure_events: u64,
    pub protocol_errors: u64,
    pub port: Option<u16>,
    /// Bytes written but not yet flushed to the child's stdin
    pub stdin_backlog_bytes: usize,
    pub restart_state: RestartState,
    /// Restarts since the last stability reset
    pub restart_attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uptime_only_while_running() {
        let mut status = SupervisorStatus::default();
        assert_eq!(status.snapshot(0, None).uptime_ms, None);

        status.mark_running(42);
        let snapshot = status.snapshot(2, Some(3000));
        assert!(snapshot.running);
        assert_eq!(snapshot.pid, Some(42));
        assert!(snapshot.uptime_ms.is_some());
        assert!(snapshot.start_time.is_some());
        assert_eq!(snapshot.pending_requests, 2);
        assert_eq!(snapshot.port, Some(3000));

        status.mark_stopped();
        let snapshot = status.snapshot(0, Some(3000));
        assert!(!snapshot.running);
        assert_eq!(snapshot.uptime_ms, None);
        // Start time of the last run is kept for diagnostics
        assert!(snapshot.start_time.is_some());
    }

    #[test]
    fn test_errors_accumulate() {
        let mut status = SupervisorStatus::default();
        status.record_error("first");
        status.record_error("second");
        assert_eq!(status.error_count, 2);
        assert_eq!(status.last_error.as_deref(), Some("second"));
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = SupervisorStatus::default().snapshot(0, Some(3000));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["running"], false);
        assert_eq!(json["requestCount"], 0);
        assert_eq!(json["port"], 3000);
        assert_eq!(json["restartState"], "stable");
        assert_eq!(json["stdinBacklogBytes"], 0);
    }
}
