//! Restart policy
//!
//! Exponential backoff bounded by a maximum attempt count. The attempt
//! counter resets only after the restarted child has run for the whole
//! stability window, so a child that flaps after each restart still
//! exhausts the budget.

use serde::Serialize;
use std::time::Duration;

use crate::supervisor::config::RestartConfig;

/// Policy state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartState {
    /// No crash since the last stability reset
    Stable,
    /// At least one restart since the last stability reset
    Restarting,
    /// Budget exhausted; no further restarts
    PermanentlyFailed,
}

/// What to do about a crash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after `delay`; `attempt` is 1-based
    Restart { attempt: u32, delay: Duration },
    /// Give up after `attempts` restarts
    GiveUp { attempts: u32 },
}

/// Single authoritative restart state
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    config: RestartConfig,
    attempts: u32,
    state: RestartState,
}

impl RestartPolicy {
    pub fn new(config: RestartConfig) -> Self {
        Self {
            config,
            attempts: 0,
            state: RestartState::Stable,
        }
    }

    /// Delay before restart number `attempt_index + 1`
    ///
    /// `min(base * 2^attempt_index, max)`, saturating instead of overflowing.
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    /// Decide how to react to a crash (or a failed restart attempt)
    pub fn on_crash(&mut self) -> RestartDecision {
        if self.attempts >= self.config.max_attempts {
            self.state = RestartState::PermanentlyFailed;
            return RestartDecision::GiveUp {
                attempts: self.attempts,
            };
        }

        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        self.state = RestartState::Restarting;
        RestartDecision::Restart {
            attempt: self.attempts,
            delay,
        }
    }

    /// The restarted child survived the stability window
    pub fn on_stable(&mut self) {
        if self.state != RestartState::PermanentlyFailed {
            self.attempts = 0;
            self.state = RestartState::Stable;
        }
    }

    /// Forget all history, used on an explicit start
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.state = RestartState::Stable;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn state(&self) -> RestartState {
        self.state
    }

    pub fn stability_window(&self) -> Duration {
        self.config.stability_window
    }
}
