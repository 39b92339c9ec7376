//! Worker loops: dequeue, dispatch, settle.
//!
//! A [`WorkerCollection`] owns a fixed number of [`Worker`] loops on its own
//! pool. Each dequeued message is processed inline, or handed to a
//! [`TaskFactory`](crate::scheduler::TaskFactory) when the collection is
//! configured for asynchronous dispatch.

pub mod collection;
pub mod context;
pub mod notifications;
pub(crate) mod poller;
pub(crate) mod processor;
pub mod wait;
#[allow(clippy::module_inception)]
pub mod worker;

pub use collection::WorkerCollection;
pub use context::MessageContext;
pub use notifications::{SystemError, UserCodeError, WorkerNotifications};
pub use wait::LinearBackoff;
pub use worker::{IdleStatus, Worker};
