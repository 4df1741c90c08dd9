//! Breaker counters and a serializable snapshot of them.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::BreakerState;

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerMetrics {
    /// Breaker name from the config
    pub name: String,

    /// Current state
    pub state: BreakerState,

    /// Failures counted since the last reset
    pub failure_count: u32,

    /// Operations currently registered as in flight
    pub in_flight: usize,

    /// Operations handed to the execution pool
    pub dispatched: u64,

    /// Calls refused because the circuit was open or a trial was outstanding
    pub rejected_open: u64,

    /// Calls refused because the pool was saturated
    pub rejected_capacity: u64,

    /// Successful results reported by handles
    pub successes: u64,

    /// Failed results reported by handles
    pub failures: u64,

    /// Operations cancelled by the watchdog
    pub timeouts: u64,

    /// Times the circuit opened
    pub trips: u64,

    /// Current execution pool epoch (0 before the first pool)
    pub pool_epoch: u64,

    /// When the state last changed
    pub last_transition_at: Option<DateTime<Utc>>,
}

/// Lock-free counters updated by the breaker.
#[derive(Debug, Default)]
pub(crate) struct MetricsRecorder {
    dispatched: AtomicU64,
    rejected_open: AtomicU64,
    rejected_capacity: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    trips: AtomicU64,
    last_transition_at: RwLock<Option<DateTime<Utc>>>,
}

impl MetricsRecorder {
    pub(crate) fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_open(&self) {
        self.rejected_open.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected_capacity(&self) {
        self.rejected_capacity.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_trip(&self) {
        self.trips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transition(&self) {
        *self.last_transition_at.write() = Some(Utc::now());
    }

    /// Fill a snapshot with the counters; the caller supplies live state.
    pub(crate) fn snapshot(
        &self,
        name: &str,
        state: BreakerState,
        failure_count: u32,
        in_flight: usize,
        pool_epoch: u64,
    ) -> BreakerMetrics {
        BreakerMetrics {
            name: name.to_string(),
            state,
            failure_count,
            in_flight,
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected_open: self.rejected_open.load(Ordering::Relaxed),
            rejected_capacity: self.rejected_capacity.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            trips: self.trips.load(Ordering::Relaxed),
            pool_epoch,
            last_transition_at: *self.last_transition_at.read(),
        }
    }
}
