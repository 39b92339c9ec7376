//! Backpressure gate: lets saturated callers wait instead of polling.
//!
//! Each work group (plus a default, ungrouped gate) is a manual-reset signal.
//! `set` opens it and wakes every waiter, `reset` closes it again. A woken
//! caller does not own a slot; it has to re-check room with the scheduler.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why a [`BackpressureGate::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateWake {
    /// The gate was set; capacity may be available.
    Signalled,
    /// The gate was cancelled; the caller should shut down.
    Cancelled,
}

#[derive(Debug)]
pub struct BackpressureGate {
    default: Arc<watch::Sender<bool>>,
    groups: RwLock<HashMap<String, Arc<watch::Sender<bool>>>>,
    cancel: CancellationToken,
}

impl Default for BackpressureGate {
    fn default() -> Self {
        Self::new()
    }
}

impl BackpressureGate {
    pub fn new() -> Self {
        let (default, _) = watch::channel(false);
        Self {
            default: Arc::new(default),
            groups: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Suspend until the gate for `group` is set or the gate is cancelled.
    pub async fn wait(&self, group: Option<&str>) -> GateWake {
        if self.cancel.is_cancelled() {
            return GateWake::Cancelled;
        }

        let mut rx = self.channel(group).subscribe();
        let opened = async move { rx.wait_for(|open| *open).await.is_ok() };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => GateWake::Cancelled,
            ok = opened => {
                if ok { GateWake::Signalled } else { GateWake::Cancelled }
            }
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning `None`.
    pub async fn wait_timeout(&self, group: Option<&str>, timeout: Duration) -> Option<GateWake> {
        tokio::time::timeout(timeout, self.wait(group)).await.ok()
    }

    /// Open the gate for `group`, releasing all current waiters.
    pub fn set(&self, group: Option<&str>) {
        self.channel(group).send_replace(true);
    }

    /// Close the gate for `group` so later waits block again.
    pub fn reset(&self, group: Option<&str>) {
        self.channel(group).send_replace(false);
    }

    pub fn is_set(&self, group: Option<&str>) -> bool {
        *self.channel(group).borrow()
    }

    /// Release every waiter in every group, now and forever.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn channel(&self, group: Option<&str>) -> Arc<watch::Sender<bool>> {
        let Some(name) = group else {
            return Arc::clone(&self.default);
        };

        if let Some(tx) = self
            .groups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return Arc::clone(tx);
        }

        let mut groups = self.groups.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            groups
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(watch::channel(false).0)),
        )
    }
}
