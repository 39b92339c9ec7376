//! Single-poller coordination for idle queues.
//!
//! When the queue runs dry, one worker claims the poller role and keeps
//! polling with back-off. The others park until the poller finds a message
//! (or gives up the role on exit), then all of them resume polling.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

#[derive(Debug)]
pub(crate) struct SinglePoller {
    claimed: AtomicBool,
    wake: watch::Sender<u64>,
}

impl SinglePoller {
    pub(crate) fn new() -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            claimed: AtomicBool::new(false),
            wake,
        }
    }

    /// Subscribe before calling [`try_claim`](Self::try_claim) so a release in
    /// between is not missed.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.wake.subscribe()
    }

    pub(crate) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give up the poller role and wake every parked worker.
    pub(crate) fn release(&self) {
        self.claimed.store(false, Ordering::Release);
        self.wake.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    #[cfg(test)]
    fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}
