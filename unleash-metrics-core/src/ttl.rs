//! Time-windowed buffer of values
//!
//! Each value added to a [`TtlWindow`] expires `expire_after` past its
//! timestamp. Expired values are handed to the window's [`ExpiryListener`]:
//! synchronously at insertion when already stale, otherwise by the periodic
//! sweep that walks the list from its oldest end.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::list::LinkedList;
use crate::lock;
use crate::scheduler::PeriodicTask;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpireUnit {
    Seconds,
    Minutes,
    Hours,
}

/// How long a value stays in a window, e.g. `1 hours`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireAfter {
    pub amount: u32,
    pub unit: ExpireUnit,
}

impl ExpireAfter {
    pub const fn seconds(amount: u32) -> Self {
        Self {
            amount,
            unit: ExpireUnit::Seconds,
        }
    }

    pub const fn minutes(amount: u32) -> Self {
        Self {
            amount,
            unit: ExpireUnit::Minutes,
        }
    }

    pub const fn hours(amount: u32) -> Self {
        Self {
            amount,
            unit: ExpireUnit::Hours,
        }
    }

    pub fn as_delta(&self) -> TimeDelta {
        let amount = i64::from(self.amount);
        match self.unit {
            ExpireUnit::Seconds => TimeDelta::seconds(amount),
            ExpireUnit::Minutes => TimeDelta::minutes(amount),
            ExpireUnit::Hours => TimeDelta::hours(amount),
        }
    }
}

impl Default for ExpireAfter {
    fn default() -> Self {
        Self::hours(1)
    }
}

/// Receives every value that leaves a window, exactly once.
pub trait ExpiryListener<T> {
    fn on_expire(&mut self, value: T, expiry: DateTime<Utc>);
}

#[derive(Clone, Debug)]
pub struct TtlEntry<T> {
    pub value: T,
    pub expiry: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TtlWindow<T, L> {
    /// `None` once destroyed
    list: Option<LinkedList<TtlEntry<T>>>,
    expire_after: ExpireAfter,
    interval: Duration,
    listener: L,
}

pub type SharedWindow<T, L> = Arc<Mutex<TtlWindow<T, L>>>;

impl<T, L> TtlWindow<T, L>
where
    L: ExpiryListener<T>,
{
    pub fn new(expire_after: ExpireAfter, interval: Duration, listener: L) -> Self {
        Self {
            list: Some(LinkedList::new()),
            expire_after,
            interval,
            listener,
        }
    }

    /// Add `value` stamped at `timestamp`.
    ///
    /// If its expiry is not after `now` the listener receives it immediately
    /// and it never enters the window. Returns whether the value was kept.
    /// A destroyed window drops the value silently.
    pub fn add(&mut self, value: T, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let Some(list) = self.list.as_mut() else {
            return false;
        };

        let expiry = timestamp
            .checked_add_signed(self.expire_after.as_delta())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if now < expiry {
            list.add(TtlEntry { value, expiry });
            true
        } else {
            self.listener.on_expire(value, expiry);
            false
        }
    }

    /// Evict every entry whose expiry has passed, oldest first, stopping at
    /// the first entry still live. Returns the number evicted.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let Some(list) = self.list.as_mut() else {
            return 0;
        };
        let listener = &mut self.listener;
        list.evict_from_tail_while(
            |entry| now < entry.expiry,
            |entry| listener.on_expire(entry.value, entry.expiry),
        )
    }

    /// Release the buffered entries without expiring them. Later `add` and
    /// `sweep` calls are no-ops. Idempotent.
    pub fn destroy(&mut self) {
        self.list = None;
    }

    pub fn is_destroyed(&self) -> bool {
        self.list.is_none()
    }

    pub fn len(&self) -> usize {
        self.list.as_ref().map_or(0, LinkedList::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expiry times of the buffered entries, newest first.
    pub fn expiries(&self) -> Vec<DateTime<Utc>> {
        self.list
            .as_ref()
            .map(|list| list.iter().map(|entry| entry.expiry).collect())
            .unwrap_or_default()
    }

    pub fn expire_after(&self) -> ExpireAfter {
        self.expire_after
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }
}

/// Sweep `window` every `window.interval()` using `clock` for the current
/// time. Cancelling (or dropping) the returned task stops the sweeps.
pub fn spawn_sweeper<T, L>(
    name: &'static str,
    window: SharedWindow<T, L>,
    clock: Arc<dyn Clock>,
) -> PeriodicTask
where
    T: Send + 'static,
    L: ExpiryListener<T> + Send + 'static,
{
    let interval = lock(&window).interval();

    PeriodicTask::spawn(name, interval, move || {
        let window = Arc::clone(&window);
        let clock = Arc::clone(&clock);
        async move {
            let now = clock.now();
            let evicted = lock(&window).sweep(now);
            if evicted > 0 {
                debug!(window = name, evicted, "expired window entries");
            }
        }
    })
}
