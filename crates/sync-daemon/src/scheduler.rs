//! Deferred automatic sync triggers.
//!
//! Holds at most one pending cycle. Scheduling again while one is pending
//! only ever pushes the deadline later, so a burst of edits collapses into
//! a single cycle after the burst.

use bookmark_sync_core::orchestrator::Trigger;
use std::time::Duration;
use tokio::time::Instant;

/// Quiet period after a local change before syncing.
pub const DEBOUNCE: Duration = Duration::from_secs(2);

/// Delay before the first cycle after startup.
pub const STARTUP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct Scheduler {
    pending: Option<(Instant, Trigger)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a cycle after a local change.
    pub fn schedule_passive(&mut self) {
        self.schedule(Trigger::Passive, DEBOUNCE);
    }

    /// Schedule a cycle `delay` from now.
    ///
    /// A pending cycle keeps its trigger and takes the later deadline.
    pub fn schedule(&mut self, trigger: Trigger, delay: Duration) {
        let deadline = Instant::now() + delay;
        self.pending = Some(match self.pending {
            Some((existing, pending_trigger)) => (existing.max(deadline), pending_trigger),
            None => (deadline, trigger),
        });
    }

    /// Wait for the pending deadline and take its trigger.
    ///
    /// Never resolves while nothing is pending. Cancel safe: dropping the
    /// future leaves the pending cycle in place.
    pub async fn wait(&mut self) -> Trigger {
        let Some((deadline, _)) = self.pending else {
            return std::future::pending().await;
        };
        tokio::time::sleep_until(deadline).await;
        match self.pending.take() {
            Some((_, trigger)) => trigger,
            None => std::future::pending().await,
        }
    }
}
