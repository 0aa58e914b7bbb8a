//! Client metrics aggregation for Unleash.
//!
//! SDKs report per-toggle yes/no/variant counts in time buckets. This crate
//! folds those buckets into rolling last-hour and last-minute projections,
//! tracks which applications have seen which toggles, and batches client
//! registrations out to store collaborators.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod clock;
pub mod config;
pub mod count;
pub mod error;
pub mod event;
pub mod list;
pub mod model;
pub mod projection;
pub mod scheduler;
pub mod schema;
pub mod service;
pub mod store;
pub mod ttl;

pub use clock::{Clock, ManualClock, RuntimeClock, SystemClock};
pub use config::MetricsConfig;
pub use error::{MetricsError, StoreError, ValidationError};
pub use service::ClientMetricsService;

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Every piece of state guarded this way stays internally consistent between
/// statements, so a poisoned lock carries no torn data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
