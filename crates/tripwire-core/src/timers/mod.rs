//! Background timers owned by a breaker.
//!
//! The watchdog and the recovery timer run on a small dedicated runtime so
//! they keep ticking even when the execution pool is saturated. Both hold
//! only a weak reference to their target and exit once it is dropped.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

pub(crate) mod recovery;
pub(crate) mod watchdog;

/// What the timers drive. Implemented by the breaker state machine.
pub(crate) trait Supervised: Send + Sync + 'static {
    /// One watchdog tick: cancel operations past the call timeout.
    fn sweep_in_flight(self: &Arc<Self>);

    /// The reset timeout elapsed: allow a trial call.
    fn begin_half_open(self: &Arc<Self>);
}

/// Runtime hosting the watchdog and recovery timers.
pub(crate) struct Scheduler {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl Scheduler {
    pub(crate) fn new() -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tripwire-timer")
            .enable_time()
            .build()?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
