//! Timeout watchdog.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use super::{Scheduler, Supervised};

/// Start a watchdog that sweeps `target` every `period`.
///
/// The first sweep happens one period after start. The loop ends when the
/// task is aborted or the target is dropped.
pub(crate) fn spawn<S: Supervised>(
    scheduler: &Scheduler,
    target: Weak<S>,
    period: Duration,
) -> JoinHandle<()> {
    scheduler.spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(target) = target.upgrade() else {
                tracing::trace!("Breaker dropped, watchdog exiting");
                break;
            };
            target.sweep_in_flight();
        }
    })
}
