//! Completion interceptor returned by [`CircuitBreaker::call`](super::CircuitBreaker::call).

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use super::registry::{OperationControl, OperationId};
use super::BreakerInner;
use crate::error::BreakerError;

/// Handle to one dispatched operation.
///
/// Retrieving the result consumes the handle and reports the outcome to the
/// breaker exactly once. A handle dropped without retrieval is detached: its
/// operation stays under the call timeout, and once it finishes the breaker
/// counts its success or failure as if it had been retrieved.
///
/// Outcomes are not weighed equally while the circuit is half-open. Only the
/// outstanding trial can close it, but any failure retrieved in that state
/// re-opens it, including a handle left over from before the trip.
#[must_use = "dropping a handle detaches the operation and discards its result"]
pub struct CallHandle<T, E> {
    id: OperationId,
    join: JoinHandle<Result<T, E>>,
    control: Arc<OperationControl>,
    breaker: Arc<BreakerInner>,
    reported: bool,
}

impl<T, E> CallHandle<T, E> {
    pub(crate) fn new(
        id: OperationId,
        join: JoinHandle<Result<T, E>>,
        control: Arc<OperationControl>,
        breaker: Arc<BreakerInner>,
    ) -> Self {
        Self {
            id,
            join,
            control,
            breaker,
            reported: false,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Cancel the operation.
    ///
    /// With `interrupt_if_running` the task is aborted at its next await
    /// point; otherwise it runs on but its result is discarded. Returns false
    /// if the operation already finished or was already cancelled. The
    /// failure is reported when the handle is retrieved.
    pub fn cancel(&self, interrupt_if_running: bool) -> bool {
        self.control.cancel(interrupt_if_running)
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// True once the operation finished or was cancelled.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.join.is_finished()
    }

    /// Wait for the result and report it to the breaker.
    pub async fn get(mut self) -> Result<T, BreakerError<E>> {
        let outcome = self.wait().await;
        self.report(outcome)
    }

    /// Like [`get`](Self::get), but give up after `timeout`.
    ///
    /// Giving up cancels the operation and counts as a failure.
    pub async fn get_timeout(mut self, timeout: Duration) -> Result<T, BreakerError<E>> {
        let outcome = match tokio::time::timeout(timeout, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BreakerError::TimedOut(timeout)),
        };
        self.report(outcome)
    }

    /// Blocking variant of [`get`](Self::get) for synchronous callers.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime context.
    pub fn blocking_get(self) -> Result<T, BreakerError<E>> {
        let runtime = self.breaker.scheduler.handle().clone();
        runtime.block_on(self.get())
    }

    /// Blocking variant of [`get_timeout`](Self::get_timeout).
    ///
    /// # Panics
    ///
    /// Panics when called from within an async runtime context.
    pub fn blocking_get_timeout(self, timeout: Duration) -> Result<T, BreakerError<E>> {
        let runtime = self.breaker.scheduler.handle().clone();
        runtime.block_on(self.get_timeout(timeout))
    }

    async fn wait(&mut self) -> Result<T, BreakerError<E>> {
        let cancelled = self.control.subscribe();
        tokio::select! {
            biased;
            () = wait_cancelled(cancelled) => Err(BreakerError::Cancelled),
            joined = &mut self.join => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(BreakerError::Operation(err)),
                Err(err) => Err(join_failure(err)),
            },
        }
    }

    fn report(&mut self, outcome: Result<T, BreakerError<E>>) -> Result<T, BreakerError<E>> {
        self.reported = true;
        match &outcome {
            Ok(_) => self.breaker.on_success(self.id),
            Err(err) => {
                self.control.cancel(true);
                self.breaker.on_failure(self.id, err.kind());
            }
        }
        outcome
    }
}

impl<T, E> Drop for CallHandle<T, E> {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.detach(self.id);
        }
    }
}

impl<T, E> fmt::Debug for CallHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("done", &self.is_done())
            .finish()
    }
}

async fn wait_cancelled(mut cancelled: watch::Receiver<bool>) {
    if cancelled.wait_for(|c| *c).await.is_err() {
        // Sender gone: the control is dropped, so only the join can finish.
        std::future::pending::<()>().await;
    }
}

fn join_failure<E>(err: JoinError) -> BreakerError<E> {
    if err.is_cancelled() {
        return BreakerError::Cancelled;
    }
    match err.try_into_panic() {
        Ok(payload) => BreakerError::Panicked(panic_message(payload)),
        Err(_) => BreakerError::Cancelled,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "operation panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_downcasts_common_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42_u8)), "operation panicked");
    }

    #[tokio::test]
    async fn test_aborted_join_maps_to_cancelled() {
        let task = tokio::spawn(tokio::time::sleep(Duration::from_secs(60)));
        task.abort();
        let err = task.await.unwrap_err();

        assert!(matches!(join_failure::<()>(err), BreakerError::Cancelled));
    }
}
