//! Reconnection state machine.
//!
//! ```text
//!            start            connected
//!   Idle ──────────► Connecting ─────────► Connected
//!    ▲                  ▲   │                 │
//!    │ reset      retry │   │ failure         │ disconnected
//!    │                  │   ▼                 ▼
//!    │               Backoff { attempt, delay } ◄┘
//!    │                      │
//!    │                      │ failures == max_attempts
//!    └────────────────── GaveUp
//! ```
//!
//! Pure bookkeeping; the channel supervisor owns the timers.

use std::time::Duration;

use crate::config::BackoffConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    /// Waiting `delay` before connection attempt number `attempt`.
    Backoff { attempt: u32, delay: Duration },
    GaveUp,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    config: BackoffConfig,
    state: ConnectionState,
    /// Consecutive failed connection attempts.
    failures: u32,
}

impl ReconnectMachine {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Idle → Connecting.
    pub fn start(&mut self) -> ConnectionState {
        if self.state == ConnectionState::Idle {
            self.state = ConnectionState::Connecting;
        }
        self.state
    }

    /// Connecting → Connected. Clears the failure count.
    pub fn on_connected(&mut self) -> ConnectionState {
        self.failures = 0;
        self.state = ConnectionState::Connected;
        self.state
    }

    /// A connection attempt failed: back off, or give up once the attempt
    /// budget is spent.
    pub fn on_failure(&mut self) -> ConnectionState {
        self.failures += 1;
        self.state = if self.failures >= self.config.max_attempts {
            ConnectionState::GaveUp
        } else {
            ConnectionState::Backoff {
                attempt: self.failures + 1,
                delay: self.config.delay_for(self.failures),
            }
        };
        self.state
    }

    /// An established connection dropped. Starts a fresh backoff sequence.
    pub fn on_disconnected(&mut self) -> ConnectionState {
        self.failures = 0;
        self.state = ConnectionState::Backoff {
            attempt: 1,
            delay: self.config.base.min(self.config.max),
        };
        self.state
    }

    /// Backoff → Connecting once the delay has elapsed.
    pub fn retry(&mut self) -> ConnectionState {
        if matches!(self.state, ConnectionState::Backoff { .. }) {
            self.state = ConnectionState::Connecting;
        }
        self.state
    }

    /// Back to Idle from any state, forgetting past failures.
    pub fn reset(&mut self) -> ConnectionState {
        self.failures = 0;
        self.state = ConnectionState::Idle;
        self.state
    }
}
