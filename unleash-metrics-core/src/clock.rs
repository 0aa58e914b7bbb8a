//! Wall-clock sources
//!
//! Bucket timestamps are wall-clock times reported by SDKs, so expiry is
//! computed against a wall clock rather than a monotonic one. The clock is
//! injected so tests can move time deterministically.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};

use crate::lock;

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut now = lock(&self.now);
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// Wall time derived from the tokio clock.
///
/// Anchored to the wall time at construction and advanced by
/// `tokio::time::Instant`, so a paused runtime (`start_paused`) moves this
/// clock in lockstep with its timers.
#[derive(Debug)]
pub struct RuntimeClock {
    anchor_wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl RuntimeClock {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    pub fn anchored_at(anchor_wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.anchor);
        TimeDelta::from_std(elapsed)
            .ok()
            .and_then(|delta| self.anchor_wall.checked_add_signed(delta))
            .unwrap_or(self.anchor_wall)
    }
}
