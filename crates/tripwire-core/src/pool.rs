//! Bounded execution pool.
//!
//! Each pool owns a dedicated multi-threaded tokio runtime, so application
//! work never shares threads with breaker bookkeeping. At most `max_workers`
//! operations run at once and up to `queue_capacity` more wait for a worker
//! slot. Anything beyond that is refused at submission time.
//!
//! A pool lives for one epoch. When the breaker trips, the pool is shut down
//! in the background: queued and running tasks are dropped at their next
//! await point and the next eligible call builds a fresh pool.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;

/// Submission refused because the pool and its queue are full.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{in_flight} operations in flight, capacity {capacity}")]
pub(crate) struct Saturated {
    pub in_flight: usize,
    pub capacity: usize,
}

/// Releases one admission when the submitted task finishes or is dropped.
struct Admission(Arc<AtomicUsize>);

impl Drop for Admission {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct ExecutionPool {
    runtime: Option<Runtime>,
    handle: Handle,
    slots: Arc<Semaphore>,
    admitted: Arc<AtomicUsize>,
    capacity: usize,
    epoch: u64,
}

impl ExecutionPool {
    /// Start a pool runtime for the given epoch.
    pub(crate) fn new(config: &PoolConfig, epoch: u64) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.idle_workers.max(1))
            .max_blocking_threads(config.max_workers.max(1))
            .thread_name(format!("tripwire-pool-{epoch}"))
            .enable_all()
            .build()?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            slots: Arc::new(Semaphore::new(config.max_workers)),
            admitted: Arc::new(AtomicUsize::new(0)),
            capacity: config.capacity(),
            epoch,
        })
    }

    /// Submit an operation, or refuse it when the pool is saturated.
    pub(crate) fn submit<F>(&self, operation: F) -> Result<JoinHandle<F::Output>, Saturated>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let capacity = self.capacity;
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|in_flight| Saturated {
                in_flight,
                capacity,
            })?;

        let admission = Admission(Arc::clone(&self.admitted));
        let slots = Arc::clone(&self.slots);

        Ok(self.handle.spawn(async move {
            let _admission = admission;
            // The semaphore is never closed; a failed acquire only happens
            // while the runtime is tearing the task down.
            let _slot = slots.acquire_owned().await.ok();
            operation.await
        }))
    }

    /// Operations admitted and not yet finished (running or queued).
    pub(crate) fn in_flight(&self) -> usize {
        self.admitted.load(Ordering::Acquire)
    }

    /// Drop all queued and running work and release the runtime threads.
    pub(crate) fn shutdown(mut self) {
        tracing::debug!(
            epoch = self.epoch,
            in_flight = self.in_flight(),
            "Shutting down execution pool"
        );
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        // A blocking runtime drop would panic inside async contexts.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{oneshot, watch};

    fn pool(max_workers: usize, queue_capacity: usize) -> ExecutionPool {
        ExecutionPool::new(&PoolConfig::new(1, max_workers, queue_capacity), 1).unwrap()
    }

    #[tokio::test]
    async fn test_runs_submitted_work() {
        let pool = pool(2, 0);
        let handle = pool.submit(async { 21 * 2 }).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_refuses_work_beyond_workers_and_queue() {
        let pool = pool(1, 1);
        let (release_tx, release_rx) = watch::channel(false);

        let mut admitted = Vec::new();
        for _ in 0..2 {
            let mut release = release_rx.clone();
            admitted.push(
                pool.submit(async move {
                    let _ = release.wait_for(|go| *go).await;
                })
                .unwrap(),
            );
        }

        let refused = pool.submit(async {}).unwrap_err();
        assert_eq!(
            refused,
            Saturated {
                in_flight: 2,
                capacity: 2
            }
        );

        release_tx.send_replace(true);
        for handle in admitted {
            handle.await.unwrap();
        }
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.submit(async {}).is_ok());
    }

    #[tokio::test]
    async fn test_queued_work_waits_for_a_slot() {
        let pool = pool(1, 4);
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let _blocker = pool
            .submit(async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
            })
            .unwrap();
        started_rx.await.unwrap();
        let queued = pool.submit(async { "ran" }).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!queued.is_finished());

        release_tx.send(()).unwrap();
        assert_eq!(queued.await.unwrap(), "ran");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_outstanding_work() {
        let pool = pool(1, 1);
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let running = pool
            .submit(async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .unwrap();
        started_rx.await.unwrap();
        let queued = pool.submit(async {}).unwrap();

        pool.shutdown();

        assert!(running.await.unwrap_err().is_cancelled());
        assert!(queued.await.unwrap_err().is_cancelled());
    }
}
