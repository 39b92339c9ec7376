//! # workq
//!
//! Concurrency engine for message-queue clients.
//!
//! Provides bounded admission control over named work groups, the worker
//! loops that drive messages through it, and heartbeat tracking that keeps
//! long-running messages claimed and recovers the ones whose worker died.
//! Storage and dequeue are left to a [`transport::MessageTransport`].

pub mod config;
pub mod error;
pub mod heartbeat;
pub mod lifecycle;
pub mod memory;
pub mod model;
pub mod pool;
pub mod scheduler;
pub mod telemetry;
pub mod transport;
pub mod worker;
