//! Drain state machine.
//!
//! ```text
//!              DrainRequested              Connected
//!   Idle ─────────────────────▶ Connecting ─────────▶ Draining
//!    ▲  ▲                           │                   │  │
//!    │  │ DrainSucceeded            │ DrainFailed       │  │
//!    │  └───────────────────────────┼───────────────────┘  │ DrainFailed
//!    │ BackoffElapsed / LinkUp      ▼                      ▼
//!    └──────────────────────── BackingOff{until, attempt} ◀┘
//! ```
//!
//! `Connecting` and `Draining` are the in-flight states: a drain request
//! there is refused, which makes the machine the drain's exclusivity guard.
//! Time comes from an injected [`Clock`].

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Connecting,
    Draining,
    BackingOff { until: DateTime<Utc>, attempt: u32 },
}

impl SyncState {
    /// Whether a drain pass is running.
    #[must_use]
    pub const fn in_flight(&self) -> bool {
        matches!(self, Self::Connecting | Self::Draining)
    }
}

/// Named transition triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    DrainRequested,
    Connected,
    DrainSucceeded,
    DrainFailed,
    BackoffElapsed,
    LinkUp,
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::days(36_500));
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map_or_else(|p| *p.into_inner(), |now| *now)
    }
}

/// The machine itself. Rejected triggers leave the state unchanged.
#[derive(Debug, Clone)]
pub struct SyncMachine {
    state: SyncState,
    failures: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl SyncMachine {
    #[must_use]
    pub const fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            state: SyncState::Idle,
            failures: 0,
            backoff_base,
            backoff_max,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SyncState {
        self.state
    }

    /// Consecutive failed passes.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Wait after the `attempt`-th consecutive failure: the base doubled per
    /// earlier failure, capped at the max.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }

    /// Applies `trigger` at `now`. Returns the new state if it was accepted.
    pub fn fire(&mut self, trigger: SyncTrigger, now: DateTime<Utc>) -> Option<SyncState> {
        use SyncState::{BackingOff, Connecting, Draining, Idle};
        use SyncTrigger as T;

        let next = match (self.state, trigger) {
            (Idle, T::DrainRequested) => Connecting,
            (BackingOff { until, .. }, T::DrainRequested) if now >= until => Connecting,
            (BackingOff { until, .. }, T::BackoffElapsed) if now >= until => Idle,
            (BackingOff { .. }, T::LinkUp) => Idle,
            (Connecting, T::Connected) => Draining,
            (Draining, T::DrainSucceeded) => {
                self.failures = 0;
                Idle
            }
            (Connecting | Draining, T::DrainFailed) => {
                self.failures = self.failures.saturating_add(1);
                let delay = chrono::Duration::from_std(self.backoff_delay(self.failures))
                    .unwrap_or_else(|_| chrono::Duration::days(36_500));
                BackingOff {
                    until: now.checked_add_signed(delay).unwrap_or(now),
                    attempt: self.failures,
                }
            }
            _ => return None,
        };
        self.state = next;
        Some(next)
    }
}
