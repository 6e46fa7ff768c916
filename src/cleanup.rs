//! Scheduled cleanup of expired tickets and idle rate-limit state.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::rate_limit::RateLimiter;
use crate::tickets::TicketStore;

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Run all cleanup tasks once. Returns the number of tickets removed.
pub fn run_cleanup(tickets: &TicketStore, rate_limiter: &dyn RateLimiter) -> usize {
    let removed = tickets.sweep();
    if removed > 0 {
        info!(count = removed, "Swept expired tickets");
    }

    rate_limiter.prune();
    removed
}

/// Handle to the background sweeper.
///
/// The task stops when [`SweeperHandle::shutdown`] is called, when the handle
/// is dropped, or when the ticket store it sweeps has been dropped.
pub struct SweeperHandle {
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Spawn a background task that sweeps `tickets` every `interval`.
///
/// Only a weak reference to the store is held, so the task never keeps the
/// store alive past the rest of the application.
pub fn spawn_sweeper(
    tickets: Weak<TicketStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    interval: Duration,
) -> SweeperHandle {
    let handle = tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        timer.tick().await;

        loop {
            timer.tick().await;
            let Some(store) = tickets.upgrade() else {
                debug!("Ticket store dropped, stopping sweeper");
                break;
            };
            run_cleanup(&store, rate_limiter.as_ref());
        }
    });

    SweeperHandle {
        handle: Some(handle),
    }
}
