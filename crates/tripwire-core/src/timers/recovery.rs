//! Recovery timer: one-shot transition from open to half-open.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::{Scheduler, Supervised};

/// Schedule `target` to enter half-open after `delay`.
pub(crate) fn schedule<S: Supervised>(
    scheduler: &Scheduler,
    target: Weak<S>,
    delay: Duration,
) -> JoinHandle<()> {
    scheduler.spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(target) = target.upgrade() {
            target.begin_half_open();
        }
    })
}
