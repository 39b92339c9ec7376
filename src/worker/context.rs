//! Per-message state handed to a [`MessageHandler`](crate::transport::MessageHandler).

use crate::heartbeat::HeartBeatWorker;
use crate::model::{HeartBeatStatus, MessageId, ReceivedMessage};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

type Hook = Box<dyn FnOnce(&ReceivedMessage) + Send>;

#[derive(Default)]
struct Hooks {
    commit: Vec<Hook>,
    rollback: Vec<Hook>,
    cleanup: Vec<Hook>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookKind {
    Commit,
    Rollback,
}

pub struct MessageContext {
    message_id: MessageId,
    worker_id: usize,
    stop: CancellationToken,
    cancel: CancellationToken,
    heartbeat: Option<Arc<HeartBeatWorker>>,
    hooks: Mutex<Hooks>,
}

impl MessageContext {
    pub(crate) fn new(
        message_id: MessageId,
        worker_id: usize,
        stop: CancellationToken,
        cancel: CancellationToken,
        heartbeat: Option<Arc<HeartBeatWorker>>,
    ) -> Self {
        Self {
            message_id,
            worker_id,
            stop,
            cancel,
            heartbeat,
            hooks: Mutex::new(Hooks::default()),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Fires when the collection starts a graceful stop. Long handlers may
    /// use it to finish early; the message is still committed on success.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Fires when in-flight work is being abandoned. The message will be
    /// rolled back regardless of what the handler returns.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fires when the heartbeat for this message failed. Never fires when
    /// heartbeats are not in use.
    pub fn heartbeat_failure_token(&self) -> Option<CancellationToken> {
        self.heartbeat.as_ref().map(|hb| hb.failure_token())
    }

    /// Latest heartbeat recorded for this message, if heartbeats are in use.
    pub fn heartbeat_status(&self) -> Option<HeartBeatStatus> {
        self.heartbeat.as_ref().map(|hb| hb.status())
    }

    /// True once processing should be abandoned, either because the
    /// collection is cancelling or because the heartbeat failed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
            || self
                .heartbeat
                .as_ref()
                .is_some_and(|hb| hb.failure_token().is_cancelled())
    }

    /// Resolves once [`is_cancelled`](Self::is_cancelled) would return true.
    pub async fn cancelled(&self) {
        match &self.heartbeat {
            Some(hb) => {
                let failure = hb.failure_token();
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = failure.cancelled() => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Run `f` after the message is committed.
    pub fn on_commit(&self, f: impl FnOnce(&ReceivedMessage) + Send + 'static) {
        self.lock_hooks().commit.push(Box::new(f));
    }

    /// Run `f` after the message is rolled back.
    pub fn on_rollback(&self, f: impl FnOnce(&ReceivedMessage) + Send + 'static) {
        self.lock_hooks().rollback.push(Box::new(f));
    }

    /// Run `f` once processing is over, whatever the outcome.
    pub fn on_cleanup(&self, f: impl FnOnce(&ReceivedMessage) + Send + 'static) {
        self.lock_hooks().cleanup.push(Box::new(f));
    }

    pub(crate) fn run_hooks(&self, kind: HookKind, message: &ReceivedMessage) {
        let hooks = {
            let mut hooks = self.lock_hooks();
            match kind {
                HookKind::Commit => std::mem::take(&mut hooks.commit),
                HookKind::Rollback => std::mem::take(&mut hooks.rollback),
            }
        };
        for hook in hooks {
            hook(message);
        }
    }

    pub(crate) fn run_cleanup(&self, message: &ReceivedMessage) {
        let hooks = std::mem::take(&mut self.lock_hooks().cleanup);
        for hook in hooks {
            hook(message);
        }
    }

    fn lock_hooks(&self) -> std::sync::MutexGuard<'_, Hooks> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("message_id", &self.message_id)
            .field("worker_id", &self.worker_id)
            .field("heartbeat", &self.heartbeat.is_some())
            .finish()
    }
}
