// ── Connection Health Monitor ──
//
// Per-interface state machine fed by probe results and callback
// liveness. The central's health task drives it; this module only
// decides states, transitions, and how long to wait next.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::time::Instant;

use crate::config::HealthConfig;

/// Connection state of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Not started yet, or set up failed.
    Disconnected,
    /// Probes answer.
    Connected,
    /// At least one probe failed, below the threshold.
    Degraded,
}

impl ConnectionState {
    /// Requests may go out in this state.
    pub fn is_usable(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

/// Availability change worth telling the host about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Available,
    Unavailable,
}

#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    state: ConnectionState,
    failures: u32,
    /// Last inbound callback event, or monitor start.
    last_callback: Instant,
}

impl HealthMonitor {
    /// A monitor for an interface that has not been set up yet. The
    /// first success reports it available.
    pub fn new(config: HealthConfig, now: Instant) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            failures: 0,
            last_callback: now,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// A probe (or any backend call) succeeded.
    pub fn record_success(&mut self) -> Option<Transition> {
        self.failures = 0;
        let previous = std::mem::replace(&mut self.state, ConnectionState::Connected);
        (previous != ConnectionState::Connected).then_some(Transition::Available)
    }

    /// A probe failed.
    pub fn record_failure(&mut self) -> Option<Transition> {
        self.failures = self.failures.saturating_add(1);
        match self.state {
            ConnectionState::Disconnected => None,
            _ if self.failures >= self.config.failure_threshold.max(1) => {
                self.state = ConnectionState::Disconnected;
                Some(Transition::Unavailable)
            }
            _ => {
                self.state = ConnectionState::Degraded;
                None
            }
        }
    }

    /// An inbound callback event arrived for this interface.
    pub fn record_callback(&mut self, now: Instant) {
        self.last_callback = now;
    }

    /// No callback event within the configured silence window.
    pub fn callback_silent(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_callback) >= self.config.callback_silence
    }

    /// How long until the next probe or reconnect attempt.
    pub fn next_delay(&self, now: Instant) -> Duration {
        match self.state {
            ConnectionState::Disconnected if self.callback_silent(now) => {
                self.config.silent_reconnect_backoff
            }
            ConnectionState::Disconnected => self.config.reconnect_backoff,
            ConnectionState::Connected | ConnectionState::Degraded => self.config.probe_interval,
        }
    }
}
