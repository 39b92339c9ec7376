//! In-process transport and heartbeat store.
//!
//! Backs the demo binary and the test suite. Messages live in a FIFO until
//! claimed, then in an in-flight table keyed by id until committed or rolled
//! back. Claimed messages carry a heartbeat timestamp so lapsed ones can be
//! found and reset exactly as a database-backed store would.

use crate::error::{Error, Result};
use crate::model::{ExpiredHeartBeat, Headers, MessageId, ReceivedMessage};
use crate::transport::{HeartBeatStore, MessageTransport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
struct Stored {
    id: MessageId,
    body: serde_json::Value,
    headers: Headers,
}

#[derive(Debug)]
struct Claimed {
    message: Stored,
    heartbeat: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    pending: VecDeque<Stored>,
    in_flight: HashMap<MessageId, Claimed>,
    committed: u64,
    rolled_back: u64,
    resets: u64,
}

#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    heartbeat: bool,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            heartbeat: true,
        }
    }

    /// A queue that reports no heartbeat support to workers.
    pub fn without_heartbeat() -> Self {
        Self {
            heartbeat: false,
            ..Self::new()
        }
    }

    pub fn send(&self, body: serde_json::Value) -> MessageId {
        self.send_with_headers(body, Headers::new())
    }

    pub fn send_with_headers(&self, body: serde_json::Value, headers: Headers) -> MessageId {
        let id = MessageId::new();
        self.lock().pending.push_back(Stored { id, body, headers });
        id
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn committed(&self) -> u64 {
        self.lock().committed
    }

    pub fn rolled_back(&self) -> u64 {
        self.lock().rolled_back
    }

    /// Messages returned to the queue by heartbeat resets.
    pub fn resets(&self) -> u64 {
        self.lock().resets
    }

    pub fn heartbeat_of(&self, id: MessageId) -> Option<DateTime<Utc>> {
        self.lock().in_flight.get(&id).map(|c| c.heartbeat)
    }

    /// Overwrite the heartbeat of a claimed message. Returns false if `id`
    /// is not in flight.
    pub fn set_heartbeat(&self, id: MessageId, at: DateTime<Utc>) -> bool {
        match self.lock().in_flight.get_mut(&id) {
            Some(claimed) => {
                claimed.heartbeat = at;
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settle(&self, id: MessageId, requeue: bool) -> Result<()> {
        let mut state = self.lock();
        let Some(claimed) = state.in_flight.remove(&id) else {
            return Err(Error::Transport(format!("message {id} is not in flight")));
        };
        if requeue {
            state.pending.push_back(claimed.message);
            state.rolled_back += 1;
        } else {
            state.committed += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageTransport for InMemoryQueue {
    async fn receive(&self, _cancel: &CancellationToken) -> Result<Option<ReceivedMessage>> {
        let mut state = self.lock();
        let Some(stored) = state.pending.pop_front() else {
            return Ok(None);
        };

        let now = Utc::now();
        let mut message = ReceivedMessage::new(stored.id, stored.body.clone());
        message.headers = stored.headers.clone();
        message.dequeued_at = now;
        if self.heartbeat {
            message.heartbeat = Some(now);
        }
        state.in_flight.insert(
            stored.id,
            Claimed {
                message: stored,
                heartbeat: now,
            },
        );
        Ok(Some(message))
    }

    async fn commit(&self, message: &ReceivedMessage) -> Result<()> {
        self.settle(message.id, false)
    }

    async fn rollback(&self, message: &ReceivedMessage) -> Result<()> {
        self.settle(message.id, true)
    }

    fn supports_heartbeat(&self) -> bool {
        self.heartbeat
    }
}

#[async_trait]
impl HeartBeatStore for InMemoryQueue {
    async fn update(&self, id: MessageId) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        Ok(self.lock().in_flight.get_mut(&id).map(|claimed| {
            claimed.heartbeat = now;
            now
        }))
    }

    async fn find_expired(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ExpiredHeartBeat>> {
        let state = self.lock();
        let mut expired: Vec<ExpiredHeartBeat> = state
            .in_flight
            .values()
            .filter(|c| c.heartbeat < older_than)
            .map(|c| ExpiredHeartBeat {
                message_id: c.message.id,
                headers: c.message.headers.clone(),
                last_heartbeat: c.heartbeat,
            })
            .collect();
        expired.sort_by_key(|e| e.last_heartbeat);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn reset(&self, id: MessageId, expected: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock();
        match state.in_flight.get(&id) {
            Some(claimed) if claimed.heartbeat == expected => {}
            _ => return Ok(false),
        }
        if let Some(claimed) = state.in_flight.remove(&id) {
            state.pending.push_back(claimed.message);
            state.resets += 1;
        }
        debug!(message_id = %id, "message reset after heartbeat lapsed");
        Ok(true)
    }
}
