//! In-flight registry.
//!
//! Records every dispatched operation with its dispatch instant and the
//! control used to cancel it. The registry lives inside the breaker lock, so
//! removal is first-remover-wins between the watchdog and result retrieval.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::AbortHandle;

/// Identifier of one dispatched operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub(crate) u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

const PENDING: u8 = 0;
const SUCCEEDED: u8 = 1;
const FAILED: u8 = 2;

/// How an operation resolved, written by the task itself.
///
/// Lets the breaker account for operations whose handle was dropped.
#[derive(Debug, Default)]
pub(crate) struct OutcomeCell(AtomicU8);

impl OutcomeCell {
    fn record(&self, succeeded: bool) {
        let outcome = if succeeded { SUCCEEDED } else { FAILED };
        self.0.store(outcome, Ordering::Release);
    }

    /// False while pending, after an error or panic, and after an abort.
    pub(crate) fn succeeded(&self) -> bool {
        self.0.load(Ordering::Acquire) == SUCCEEDED
    }
}

/// Wrap an operation so its result is recorded in `outcome`.
///
/// A panic is recorded as a failure and then resumed, so the join handle still
/// observes it.
pub(crate) async fn observe_outcome<F, T, E>(operation: F, outcome: Arc<OutcomeCell>) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    match AssertUnwindSafe(operation).catch_unwind().await {
        Ok(result) => {
            outcome.record(result.is_ok());
            result
        }
        Err(panic) => {
            outcome.record(false);
            std::panic::resume_unwind(panic)
        }
    }
}

/// Cancellation state shared between a handle and its registry entry.
pub(crate) struct OperationControl {
    cancelled: watch::Sender<bool>,
    abort: AbortHandle,
    outcome: Arc<OutcomeCell>,
}

impl OperationControl {
    pub(crate) fn new(abort: AbortHandle, outcome: Arc<OutcomeCell>) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            cancelled,
            abort,
            outcome,
        }
    }

    /// Mark the operation cancelled, aborting its task when `interrupt` is set.
    ///
    /// Returns false if the task already finished or was already cancelled.
    pub(crate) fn cancel(&self, interrupt: bool) -> bool {
        if self.abort.is_finished() {
            return false;
        }
        let newly_cancelled = self.cancelled.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        });
        if interrupt {
            self.abort.abort();
        }
        newly_cancelled
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancelled.subscribe()
    }
}

struct RegistryEntry {
    dispatched_at: Instant,
    control: Arc<OperationControl>,
    detached: bool,
}

/// Operations dispatched and not yet accounted for.
#[derive(Default)]
pub(crate) struct InFlightRegistry {
    entries: HashMap<OperationId, RegistryEntry>,
}

impl InFlightRegistry {
    pub(crate) fn register(&mut self, id: OperationId, control: Arc<OperationControl>) {
        self.register_at(id, control, Instant::now());
    }

    fn register_at(&mut self, id: OperationId, control: Arc<OperationControl>, at: Instant) {
        self.entries.insert(
            id,
            RegistryEntry {
                dispatched_at: at,
                control,
                detached: false,
            },
        );
    }

    /// Remove an entry. Returns whether it was still registered.
    pub(crate) fn remove(&mut self, id: OperationId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Handle dropped without retrieval.
    ///
    /// Finished work is removed at once and `Some(succeeded)` returned so the
    /// caller can account for it. Running work stays registered, marked
    /// detached, so the call timeout still applies to it.
    pub(crate) fn detach(&mut self, id: OperationId) -> Option<bool> {
        let entry = self.entries.get_mut(&id)?;
        if !entry.control.is_finished() {
            entry.detached = true;
            return None;
        }
        self.entries
            .remove(&id)
            .map(|entry| entry.control.outcome.succeeded())
    }

    /// Remove detached entries whose task has finished, with whether each
    /// one succeeded.
    pub(crate) fn sweep_detached(&mut self) -> Vec<(OperationId, bool)> {
        let finished: Vec<OperationId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.detached && entry.control.is_finished())
            .map(|(id, _)| *id)
            .collect();

        finished
            .into_iter()
            .filter_map(|id| {
                self.entries
                    .remove(&id)
                    .map(|entry| (id, entry.control.outcome.succeeded()))
            })
            .collect()
    }

    /// Remove and return every entry running longer than `timeout`.
    pub(crate) fn take_expired(
        &mut self,
        now: Instant,
        timeout: Duration,
    ) -> Vec<(OperationId, Arc<OperationControl>)> {
        let expired: Vec<OperationId> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.dispatched_at) > timeout)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry.control)))
            .collect()
    }

    /// Cancel every registered operation and empty the registry.
    pub(crate) fn cancel_all(&mut self) -> usize {
        let entries = std::mem::take(&mut self.entries);
        for entry in entries.values() {
            entry.control.cancel(true);
        }
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::JoinHandle;

    fn spawn_sleeper(secs: u64) -> JoinHandle<()> {
        tokio::spawn(tokio::time::sleep(Duration::from_secs(secs)))
    }

    fn control<T>(task: &JoinHandle<T>) -> Arc<OperationControl> {
        Arc::new(OperationControl::new(task.abort_handle(), Arc::default()))
    }

    #[tokio::test]
    async fn test_remove_is_first_remover_wins() {
        let task = spawn_sleeper(60);
        let mut registry = InFlightRegistry::default();
        let id = OperationId(1);
        registry.register(id, control(&task));

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
        task.abort();
    }

    #[tokio::test]
    async fn test_take_expired_only_returns_old_entries() {
        let old = spawn_sleeper(60);
        let fresh = spawn_sleeper(60);
        let mut registry = InFlightRegistry::default();
        let now = Instant::now();

        registry.register_at(
            OperationId(1),
            control(&old),
            now - Duration::from_secs(5),
        );
        registry.register_at(
            OperationId(2),
            control(&fresh),
            now,
        );

        let expired = registry.take_expired(now, Duration::from_secs(3));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, OperationId(1));
        assert_eq!(registry.len(), 1);

        old.abort();
        fresh.abort();
    }

    #[tokio::test]
    async fn test_cancel_all_aborts_tasks() {
        let first = spawn_sleeper(60);
        let second = spawn_sleeper(60);
        let mut registry = InFlightRegistry::default();
        let first_control = control(&first);
        registry.register(OperationId(1), Arc::clone(&first_control));
        registry.register(
            OperationId(2),
            control(&second),
        );

        assert_eq!(registry.cancel_all(), 2);
        assert!(registry.is_empty());
        assert!(first_control.is_cancelled());
        assert!(first.await.unwrap_err().is_cancelled());
        assert!(second.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_reports_only_the_first_cancellation() {
        let task = spawn_sleeper(60);
        let control = control(&task);

        assert!(control.cancel(false));
        assert!(control.is_cancelled());
        assert!(!control.cancel(true));
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!control.cancel(true));
    }

    #[tokio::test]
    async fn test_detached_entries_are_swept_once_finished() {
        let done = tokio::spawn(async {});
        let running = spawn_sleeper(60);
        let mut registry = InFlightRegistry::default();
        registry.register(OperationId(1), control(&done));
        registry.register(OperationId(2), control(&running));

        assert_eq!(registry.detach(OperationId(2)), None);
        assert!(registry.sweep_detached().is_empty());

        running.abort();
        let _ = running.await;
        done.await.unwrap();

        // Entry 1 finished but was never detached, so the sweep keeps it.
        // An aborted task never recorded success.
        assert_eq!(registry.sweep_detached(), vec![(OperationId(2), false)]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.detach(OperationId(1)), Some(false));
        assert!(registry.is_empty());
        assert_eq!(registry.detach(OperationId(1)), None);
    }

    #[tokio::test]
    async fn test_observed_outcome_reaches_detached_entries() {
        let mut registry = InFlightRegistry::default();
        let mut tasks = Vec::new();
        for (n, fails) in [(1, false), (2, true)] {
            let outcome = Arc::new(OutcomeCell::default());
            let task = tokio::spawn(observe_outcome(
                async move { if fails { Err("refused") } else { Ok(n) } },
                Arc::clone(&outcome),
            ));
            registry.register(
                OperationId(n),
                Arc::new(OperationControl::new(task.abort_handle(), outcome)),
            );
            tasks.push(task);
        }
        for task in tasks {
            let _ = task.await;
        }

        assert_eq!(registry.detach(OperationId(1)), Some(true));
        assert_eq!(registry.detach(OperationId(2)), Some(false));
    }

    #[tokio::test]
    async fn test_observed_panic_is_a_failure_and_still_panics() {
        let outcome = Arc::new(OutcomeCell::default());
        let task = tokio::spawn(observe_outcome(
            async {
                if true {
                    panic!("boom");
                }
                Ok::<(), ()>(())
            },
            Arc::clone(&outcome),
        ));

        assert!(task.await.unwrap_err().is_panic());
        assert!(!outcome.succeeded());
    }
}
