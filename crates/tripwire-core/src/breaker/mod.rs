//! Breaker state machine.
//!
//! # State Machine
//!
//! ```text
//!              max_failures reached
//!   Closed ───────────────────────────► Open ◄──────────┐
//!     ▲                                   │             │
//!     │ trial succeeds      reset_timeout │             │ trial fails,
//!     │                                   ▼             │ times out or
//!     └───────────────────────────── HalfOpen ──────────┘ is cancelled
//! ```
//!
//! All transitions happen under one lock. The state is mirrored into an
//! atomic so [`CircuitBreaker::state`] never waits on it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

mod handle;
mod registry;

pub use handle::CallHandle;
pub use registry::OperationId;

use registry::{observe_outcome, InFlightRegistry, OperationControl, OutcomeCell};

use crate::config::BreakerConfig;
use crate::error::{BreakerError, SetupError};
use crate::metrics::{BreakerMetrics, MetricsRecorder};
use crate::pool::ExecutionPool;
use crate::timers::{recovery, watchdog, Scheduler, Supervised};

/// State of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation, failures are counted
    Closed,

    /// All calls are rejected until the reset timeout elapses
    Open,

    /// A single trial call decides between closing and re-opening
    HalfOpen,
}

impl BreakerState {
    fn as_u8(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BreakerState::Closed,
            1 => BreakerState::Open,
            _ => BreakerState::HalfOpen,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Everything guarded by the breaker lock.
struct BreakerCore {
    state: BreakerState,
    failure_count: u32,
    pool: Option<ExecutionPool>,
    registry: InFlightRegistry,
    watchdog: Option<JoinHandle<()>>,
    recovery: Option<JoinHandle<()>>,
    epoch: u64,
}

pub(crate) struct BreakerInner {
    config: BreakerConfig,
    state: AtomicU8,
    core: Mutex<BreakerCore>,
    next_id: AtomicU64,
    metrics: MetricsRecorder,
    scheduler: Scheduler,
}

/// Circuit breaker guarding one downstream dependency.
///
/// Cloning is cheap; clones share the same state, pool and timers.
///
/// # Example
///
/// ```rust,ignore
/// use std::time::Duration;
/// use tripwire_core::{BreakerConfig, CircuitBreaker};
///
/// let config = BreakerConfig::new(3, Duration::from_secs(3), Duration::from_secs(30));
/// let breaker = CircuitBreaker::new(config)?;
///
/// let handle = breaker.call(async { fetch_quote().await })?;
/// let quote = handle.get().await?;
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker with a running pool and watchdog.
    pub fn new(config: BreakerConfig) -> Result<Self, SetupError> {
        config.validate()?;

        let inner = Arc::new(BreakerInner {
            scheduler: Scheduler::new()?,
            state: AtomicU8::new(BreakerState::Closed.as_u8()),
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                failure_count: 0,
                pool: None,
                registry: InFlightRegistry::default(),
                watchdog: None,
                recovery: None,
                epoch: 0,
            }),
            next_id: AtomicU64::new(1),
            metrics: MetricsRecorder::default(),
            config,
        });

        {
            let mut core = inner.core.lock();
            inner.ensure_pool(&mut core)?;
            inner.close_locked(&mut core);
        }

        Ok(Self { inner })
    }

    /// Dispatch an operation through the breaker.
    ///
    /// Never waits for the operation. Fails with [`BreakerError::Open`] while
    /// the circuit is open or a half-open trial is outstanding, and with
    /// [`BreakerError::Capacity`] when the pool is saturated. Neither counts
    /// as a failure.
    pub fn call<F, T, E>(&self, operation: F) -> Result<CallHandle<T, E>, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.inner.call(operation)
    }

    /// Current state. Does not take the breaker lock.
    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn call_timeout(&self) -> Duration {
        self.inner.config.call_timeout
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.inner.config
    }

    /// Failures counted since the circuit last closed or saw a success.
    pub fn failure_count(&self) -> u32 {
        self.inner.core.lock().failure_count
    }

    /// Operations dispatched and not yet accounted for.
    pub fn in_flight(&self) -> usize {
        self.inner.core.lock().registry.len()
    }

    /// Record a failure observed outside the breaker. Ignored unless closed.
    pub fn add_failure(&self) {
        let mut core = self.inner.core.lock();
        self.inner.add_failure_locked(&mut core);
    }

    /// Open the circuit now.
    ///
    /// Returns false, and does nothing, if the circuit is already open.
    pub fn break_circuit(&self) -> bool {
        let mut core = self.inner.core.lock();
        self.inner.break_circuit_locked(&mut core)
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let core = self.inner.core.lock();
        self.inner.metrics.snapshot(
            &self.inner.config.name,
            core.state,
            core.failure_count,
            core.registry.len(),
            core.epoch,
        )
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.config.name)
            .field("state", &self.state())
            .finish()
    }
}

impl BreakerInner {
    fn call<F, T, E>(self: &Arc<Self>, operation: F) -> Result<CallHandle<T, E>, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut core = self.core.lock();

        match core.state {
            BreakerState::Open => {
                self.metrics.record_rejected_open();
                tracing::debug!(breaker = %self.config.name, "Circuit open, call rejected");
                return Err(BreakerError::Open);
            }
            BreakerState::HalfOpen if !core.registry.is_empty() => {
                self.metrics.record_rejected_open();
                tracing::info!(
                    breaker = %self.config.name,
                    "Trial call already in flight, call rejected"
                );
                return Err(BreakerError::Open);
            }
            BreakerState::HalfOpen => self.start_watchdog(&mut core),
            BreakerState::Closed => {}
        }

        let pool = self
            .ensure_pool(&mut core)
            .map_err(BreakerError::PoolUnavailable)?;

        let outcome = Arc::new(OutcomeCell::default());
        let join = match pool.submit(observe_outcome(operation, Arc::clone(&outcome))) {
            Ok(join) => join,
            Err(saturated) => {
                self.metrics.record_rejected_capacity();
                tracing::debug!(
                    breaker = %self.config.name,
                    in_flight = saturated.in_flight,
                    capacity = saturated.capacity,
                    "Execution pool saturated, call rejected"
                );
                return Err(BreakerError::Capacity {
                    in_flight: saturated.in_flight,
                    capacity: saturated.capacity,
                });
            }
        };

        let id = OperationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let control = Arc::new(OperationControl::new(join.abort_handle(), outcome));
        core.registry.register(id, Arc::clone(&control));
        self.metrics.record_dispatched();

        if core.state == BreakerState::HalfOpen {
            tracing::info!(
                breaker = %self.config.name,
                operation = %id,
                "Trial call dispatched to probe the circuit"
            );
        }

        Ok(CallHandle::new(id, join, control, Arc::clone(self)))
    }

    /// Return the current pool, starting a new epoch if there is none.
    fn ensure_pool<'c>(&self, core: &'c mut BreakerCore) -> std::io::Result<&'c ExecutionPool> {
        let pool = match core.pool.take() {
            Some(pool) => pool,
            None => {
                let epoch = core.epoch + 1;
                let pool = ExecutionPool::new(&self.config.pool, epoch)?;
                core.epoch = epoch;
                tracing::debug!(breaker = %self.config.name, epoch, "Started execution pool");
                pool
            }
        };
        Ok(&*core.pool.insert(pool))
    }

    fn start_watchdog(self: &Arc<Self>, core: &mut BreakerCore) {
        if core.watchdog.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }
        core.watchdog = Some(watchdog::spawn(
            &self.scheduler,
            Arc::downgrade(self),
            self.config.watchdog_interval,
        ));
    }

    fn set_state(&self, core: &mut BreakerCore, state: BreakerState) {
        core.state = state;
        self.state.store(state.as_u8(), Ordering::Release);
        self.metrics.record_transition();
    }

    fn close_locked(self: &Arc<Self>, core: &mut BreakerCore) {
        if let Err(err) = self.ensure_pool(core) {
            tracing::warn!(
                breaker = %self.config.name,
                error = %err,
                "Execution pool could not be started, retrying on next call"
            );
        }
        core.failure_count = 0;
        self.set_state(core, BreakerState::Closed);
        self.start_watchdog(core);
        tracing::info!(breaker = %self.config.name, "Circuit closed, all calls allowed");
    }

    fn add_failure_locked(self: &Arc<Self>, core: &mut BreakerCore) {
        if core.state != BreakerState::Closed {
            return;
        }
        core.failure_count = core.failure_count.saturating_add(1);
        tracing::debug!(
            breaker = %self.config.name,
            failures = core.failure_count,
            max_failures = self.config.max_failures,
            "Failure recorded"
        );
        if core.failure_count >= self.config.max_failures {
            self.break_circuit_locked(core);
        }
    }

    fn break_circuit_locked(self: &Arc<Self>, core: &mut BreakerCore) -> bool {
        let previous = core.state;
        if previous == BreakerState::Open {
            return false;
        }

        let cancelled = core.registry.cancel_all();
        if let Some(watchdog) = core.watchdog.take() {
            watchdog.abort();
        }
        core.recovery = Some(recovery::schedule(
            &self.scheduler,
            Arc::downgrade(self),
            self.config.reset_timeout,
        ));
        if let Some(pool) = core.pool.take() {
            pool.shutdown();
        }

        self.set_state(core, BreakerState::Open);
        self.metrics.record_trip();

        if previous == BreakerState::Closed {
            tracing::error!(
                breaker = %self.config.name,
                failures = core.failure_count,
                cancelled,
                reset_timeout = ?self.config.reset_timeout,
                "Failure threshold reached, circuit opened until reset"
            );
        } else {
            tracing::error!(
                breaker = %self.config.name,
                cancelled,
                reset_timeout = ?self.config.reset_timeout,
                "Trial call failed, circuit re-opened and a new reset scheduled"
            );
        }
        true
    }

    fn on_success(self: &Arc<Self>, id: OperationId) {
        let mut core = self.core.lock();
        let tracked = core.registry.remove(id);
        self.success_locked(&mut core, id, tracked);
    }

    fn on_failure(self: &Arc<Self>, id: OperationId, kind: &'static str) {
        let mut core = self.core.lock();
        let tracked = core.registry.remove(id);
        self.failure_locked(&mut core, id, tracked, kind);
    }

    fn success_locked(self: &Arc<Self>, core: &mut BreakerCore, id: OperationId, tracked: bool) {
        self.metrics.record_success();
        core.failure_count = 0;

        // Only the outstanding trial may close the circuit; a late result from
        // a previous epoch says nothing about recovery.
        if core.state == BreakerState::HalfOpen && tracked {
            tracing::info!(breaker = %self.config.name, operation = %id, "Trial call succeeded");
            self.close_locked(core);
        }
    }

    /// Any failure seen while half-open re-opens the circuit, tracked or not.
    fn failure_locked(
        self: &Arc<Self>,
        core: &mut BreakerCore,
        id: OperationId,
        tracked: bool,
        kind: &'static str,
    ) {
        self.metrics.record_failure();
        tracing::debug!(
            breaker = %self.config.name,
            operation = %id,
            kind,
            tracked,
            "Operation failed"
        );

        match core.state {
            BreakerState::HalfOpen => {
                self.break_circuit_locked(core);
            }
            // An untracked failure was already counted by the watchdog.
            BreakerState::Closed if tracked => self.add_failure_locked(core),
            _ => {}
        }
    }

    /// Account for an operation whose handle was dropped after it finished.
    fn settle_detached_locked(
        self: &Arc<Self>,
        core: &mut BreakerCore,
        id: OperationId,
        succeeded: bool,
    ) {
        if succeeded {
            self.success_locked(core, id, true);
        } else {
            tracing::warn!(
                breaker = %self.config.name,
                operation = %id,
                "Detached operation failed"
            );
            self.failure_locked(core, id, true, "detached");
        }
    }

    fn detach(self: &Arc<Self>, id: OperationId) {
        let mut core = self.core.lock();
        if let Some(succeeded) = core.registry.detach(id) {
            self.settle_detached_locked(&mut core, id, succeeded);
        }
    }
}

impl Supervised for BreakerInner {
    fn sweep_in_flight(self: &Arc<Self>) {
        let mut core = self.core.lock();

        for (id, succeeded) in core.registry.sweep_detached() {
            self.settle_detached_locked(&mut core, id, succeeded);
        }

        let expired = core
            .registry
            .take_expired(Instant::now(), self.config.call_timeout);
        for (id, control) in expired {
            control.cancel(true);
            self.metrics.record_timeout();
            tracing::warn!(
                breaker = %self.config.name,
                operation = %id,
                call_timeout = ?self.config.call_timeout,
                state = %core.state,
                "Operation exceeded call timeout, cancelled"
            );

            if core.state == BreakerState::HalfOpen {
                self.break_circuit_locked(&mut core);
            } else {
                self.add_failure_locked(&mut core);
            }
        }
    }

    fn begin_half_open(self: &Arc<Self>) {
        let mut core = self.core.lock();
        if core.state != BreakerState::Open {
            return;
        }
        if let Some(recovery) = core.recovery.take() {
            recovery.abort();
        }
        self.set_state(&mut core, BreakerState::HalfOpen);
        tracing::info!(
            breaker = %self.config.name,
            "Circuit half-open, a single trial call will be allowed"
        );
    }
}

impl Drop for BreakerInner {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        core.registry.cancel_all();
        if let Some(watchdog) = core.watchdog.take() {
            watchdog.abort();
        }
        if let Some(recovery) = core.recovery.take() {
            recovery.abort();
        }
        // The pool and scheduler runtimes shut down in their own Drop.
    }
}
