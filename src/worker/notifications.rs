//! Callbacks the worker collection reports through.
//!
//! User-code failures and engine failures go to separate callbacks so an
//! operator can tell "my handler failed" from "the engine failed". Each kind
//! has at most one registered callback; every report is also logged.

use crate::error::{BoxError, Error};
use crate::model::MessageId;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// A message handler returned an error (or panicked).
#[derive(Debug)]
pub struct UserCodeError {
    pub worker_id: usize,
    pub message_id: MessageId,
    pub error: BoxError,
}

/// Something in the engine's own plumbing failed.
#[derive(Debug)]
pub struct SystemError {
    pub worker_id: Option<usize>,
    pub message_id: Option<MessageId>,
    pub error: Error,
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Clone, Default)]
pub struct WorkerNotifications {
    user_exception: Option<Callback<UserCodeError>>,
    system_exception: Option<Callback<SystemError>>,
    idle: Option<Callback<usize>>,
    not_idle: Option<Callback<usize>>,
}

impl WorkerNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_user_exception(mut self, f: impl Fn(&UserCodeError) + Send + Sync + 'static) -> Self {
        self.user_exception = Some(Arc::new(f));
        self
    }

    pub fn on_system_exception(mut self, f: impl Fn(&SystemError) + Send + Sync + 'static) -> Self {
        self.system_exception = Some(Arc::new(f));
        self
    }

    /// Called with the worker id when a worker goes idle.
    pub fn on_idle(mut self, f: impl Fn(&usize) + Send + Sync + 'static) -> Self {
        self.idle = Some(Arc::new(f));
        self
    }

    /// Called with the worker id when a worker picks up a message.
    pub fn on_not_idle(mut self, f: impl Fn(&usize) + Send + Sync + 'static) -> Self {
        self.not_idle = Some(Arc::new(f));
        self
    }

    pub(crate) fn user_exception(&self, report: UserCodeError) {
        warn!(
            worker_id = report.worker_id,
            message_id = %report.message_id,
            error = %report.error,
            "message handler failed"
        );
        if let Some(callback) = &self.user_exception {
            callback(&report);
        }
    }

    pub(crate) fn system_exception(&self, report: SystemError) {
        error!(
            worker_id = ?report.worker_id,
            message_id = ?report.message_id.map(|id| id.to_string()),
            error = %report.error,
            "worker plumbing failed"
        );
        if let Some(callback) = &self.system_exception {
            callback(&report);
        }
    }

    pub(crate) fn idle(&self, worker_id: usize) {
        debug!(worker_id, "worker idle");
        if let Some(callback) = &self.idle {
            callback(&worker_id);
        }
    }

    pub(crate) fn not_idle(&self, worker_id: usize) {
        debug!(worker_id, "worker busy");
        if let Some(callback) = &self.not_idle {
            callback(&worker_id);
        }
    }
}

impl std::fmt::Debug for WorkerNotifications {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerNotifications")
            .field("user_exception", &self.user_exception.is_some())
            .field("system_exception", &self.system_exception.is_some())
            .field("idle", &self.idle.is_some())
            .field("not_idle", &self.not_idle.is_some())
            .finish()
    }
}
