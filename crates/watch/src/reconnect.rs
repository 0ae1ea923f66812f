//! Connection state machine with bounded exponential backoff.
//!
//! ```text
//! Disconnected ──[begin_attempt]──▶ Connecting{n} ──[connected]──▶ Connected
//!      ▲                                 │                            │
//!      └──────────[failed, n < max]──────┘                            │
//!      └──────────────────────────[lost]──────────────────────────────┘
//!
//! Connecting{max} ──[failed]──▶ GaveUp (terminal)
//! ```
//!
//! A connection that drops before `stable_after` counts as a failed attempt,
//! so a hub that accepts and immediately closes still exhausts the budget.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    GaveUp,
}

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts allowed before giving up.
    pub max_attempts: u32,
    /// Uptime after which a dropped connection no longer counts as a failure.
    pub stable_after: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            stable_after: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug)]
pub struct Reconnect {
    backoff: Backoff,
    state: ConnState,
    failures: u32,
}

impl Reconnect {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            backoff,
            state: ConnState::Disconnected,
            failures: 0,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Move to `Connecting`.  Returns the attempt number, or `None` once
    /// given up.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        if self.state == ConnState::GaveUp {
            return None;
        }
        let attempt = self.failures + 1;
        self.state = ConnState::Connecting { attempt };
        Some(attempt)
    }

    /// The failure count survives until the session proves stable in `lost`.
    pub fn connected(&mut self) {
        self.state = ConnState::Connected;
    }

    /// A connect attempt failed.  Returns how long to wait before the next
    /// one, or `None` if the attempt budget is spent.
    pub fn failed(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.backoff.max_attempts {
            self.state = ConnState::GaveUp;
            return None;
        }
        self.state = ConnState::Disconnected;
        Some(self.backoff.delay(self.failures))
    }

    /// An established connection dropped after `uptime`.  A stable session
    /// restarts from the base delay; a short one is handled like `failed`.
    pub fn lost(&mut self, uptime: Duration) -> Option<Duration> {
        if uptime < self.backoff.stable_after {
            return self.failed();
        }
        self.failures = 0;
        self.state = ConnState::Disconnected;
        Some(self.backoff.base)
    }
}
