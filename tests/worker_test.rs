//! Integration tests for worker loops and the worker collection.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use workq::config::{HeartBeatConfig, SchedulerConfig, WorkerConfig};
use workq::error::{BoxError, Error, Result};
use workq::heartbeat::{
    HeartBeatSchedule, HeartBeatSupport, HeartBeatThreadPool, ResetHeartBeat,
};
use workq::memory::InMemoryQueue;
use workq::model::{HeartBeatStatus, MessageId, ReceivedMessage};
use workq::scheduler::{TaskFactory, TaskScheduler};
use workq::transport::{MessageHandler, MessageTransport};
use workq::worker::{
    IdleStatus, LinearBackoff, MessageContext, WorkerCollection, WorkerNotifications,
};

fn worker_config(worker_count: usize) -> WorkerConfig {
    WorkerConfig {
        worker_count,
        stop_timeout: Duration::from_secs(2),
        cancel_timeout: Duration::from_secs(2),
        abort_workers_on_stop_timeout: false,
        single_poller_when_idle: false,
        gate_wait: Duration::from_millis(50),
    }
}

fn fast_poll() -> Arc<LinearBackoff> {
    Arc::new(LinearBackoff::from_steps(vec![Duration::from_millis(5)]))
}

fn collection(
    config: WorkerConfig,
    queue: &Arc<InMemoryQueue>,
    handler: Arc<dyn MessageHandler>,
) -> WorkerCollection {
    WorkerCollection::new(config, queue.clone(), handler).with_queue_wait(fast_poll())
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ---------------------------------------------------------------------------
// Test handlers
// ---------------------------------------------------------------------------

/// Sleeps for `delay`, tracks concurrency, and optionally fails the first
/// attempt at every message.
#[derive(Default)]
struct Recording {
    delay: Duration,
    fail_first_attempt: bool,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<HashSet<MessageId>>,
    threads: Mutex<HashSet<String>>,
}

impl Recording {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl MessageHandler for Recording {
    async fn handle(
        &self,
        message: &ReceivedMessage,
        _context: &MessageContext,
    ) -> std::result::Result<(), BoxError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        let now = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        if let Some(name) = std::thread::current().name() {
            self.threads.lock().unwrap().insert(name.to_string());
        }
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::AcqRel);

        let first = self.seen.lock().unwrap().insert(message.id);
        if self.fail_first_attempt && first {
            return Err(format!("first attempt at {} fails", message.id).into());
        }
        Ok(())
    }
}

/// Blocks until handed a permit.
struct Gated {
    entered: AtomicUsize,
    release: Semaphore,
}

impl Gated {
    fn new() -> Self {
        Self {
            entered: AtomicUsize::new(0),
            release: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl MessageHandler for Gated {
    async fn handle(
        &self,
        _message: &ReceivedMessage,
        _context: &MessageContext,
    ) -> std::result::Result<(), BoxError> {
        self.entered.fetch_add(1, Ordering::AcqRel);
        self.release.acquire().await?.forget();
        Ok(())
    }
}

/// Holds the message until its context is cancelled.
struct WaitsForCancel;

#[async_trait]
impl MessageHandler for WaitsForCancel {
    async fn handle(
        &self,
        _message: &ReceivedMessage,
        context: &MessageContext,
    ) -> std::result::Result<(), BoxError> {
        context.cancelled().await;
        Err("cancelled".into())
    }
}

/// Never finishes on its own.
struct Hangs;

#[async_trait]
impl MessageHandler for Hangs {
    async fn handle(
        &self,
        _message: &ReceivedMessage,
        _context: &MessageContext,
    ) -> std::result::Result<(), BoxError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

struct Panics;

#[async_trait]
impl MessageHandler for Panics {
    async fn handle(
        &self,
        _message: &ReceivedMessage,
        _context: &MessageContext,
    ) -> std::result::Result<(), BoxError> {
        panic!("handler bug");
    }
}

/// Registers hooks and fails messages whose body says so.
struct Hooked {
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl MessageHandler for Hooked {
    async fn handle(
        &self,
        message: &ReceivedMessage,
        context: &MessageContext,
    ) -> std::result::Result<(), BoxError> {
        let label = message.body["label"].as_str().unwrap_or_default().to_string();
        let record = |kind: &'static str| {
            let events = Arc::clone(&self.events);
            let label = label.clone();
            move |_: &ReceivedMessage| events.lock().unwrap().push(format!("{kind}:{label}"))
        };
        context.on_commit(record("commit"));
        context.on_rollback(record("rollback"));
        context.on_cleanup(record("cleanup"));
        if message.body["fail"].as_bool().unwrap_or(false) {
            return Err("asked to fail".into());
        }
        Ok(())
    }
}

/// Records the heartbeat the context reports after a while.
struct WatchesHeartbeat {
    observed: Mutex<Vec<(Option<chrono::DateTime<chrono::Utc>>, Option<HeartBeatStatus>)>>,
}

#[async_trait]
impl MessageHandler for WatchesHeartbeat {
    async fn handle(
        &self,
        message: &ReceivedMessage,
        context: &MessageContext,
    ) -> std::result::Result<(), BoxError> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        self.observed
            .lock()
            .unwrap()
            .push((message.heartbeat, context.heartbeat_status()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inline processing
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn inline_workers_commit_every_message() {
    let queue = Arc::new(InMemoryQueue::new());
    for n in 0..20 {
        queue.send(serde_json::json!({ "n": n }));
    }
    let handler = Arc::new(Recording::with_delay(Duration::from_millis(5)));
    let workers = collection(worker_config(3), &queue, handler.clone());
    workers.start().unwrap();

    eventually("all messages committed", || queue.committed() == 20).await;
    assert!(workers.stop().await);
    assert_eq!(handler.calls.load(Ordering::Acquire), 20);
    assert!(handler.peak.load(Ordering::Acquire) <= 3);
    assert!(
        handler
            .threads
            .lock()
            .unwrap()
            .iter()
            .all(|t| t.starts_with("workq-worker")),
        "inline handlers run on the worker pool"
    );
    workers.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_status_follows_processing() {
    let queue = Arc::new(InMemoryQueue::new());
    let handler = Arc::new(Gated::new());
    let workers = collection(worker_config(2), &queue, handler.clone());
    assert!(!workers.all_workers_are_idle());

    workers.start().unwrap();
    assert!(workers.all_workers_are_idle());
    assert!(
        workers
            .workers()
            .iter()
            .all(|w| w.idle_status() == IdleStatus::Idle)
    );

    queue.send(serde_json::json!({}));
    eventually("handler to start", || handler.entered.load(Ordering::Acquire) == 1).await;
    assert!(!workers.all_workers_are_idle());
    assert_eq!(workers.in_flight(), 1);

    handler.release.add_permits(1);
    eventually("message committed", || queue.committed() == 1).await;
    eventually("workers idle again", || workers.all_workers_are_idle()).await;

    workers.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_notifications_fire_on_transitions() {
    let queue = Arc::new(InMemoryQueue::new());
    let busy = Arc::new(AtomicUsize::new(0));
    let idle = Arc::new(AtomicUsize::new(0));
    let notifications = {
        let busy = Arc::clone(&busy);
        let idle = Arc::clone(&idle);
        WorkerNotifications::new()
            .on_not_idle(move |_| {
                busy.fetch_add(1, Ordering::AcqRel);
            })
            .on_idle(move |_| {
                idle.fetch_add(1, Ordering::AcqRel);
            })
    };
    let workers = collection(worker_config(1), &queue, Arc::new(Recording::default()))
        .with_notifications(notifications);
    workers.start().unwrap();

    queue.send(serde_json::json!({}));
    eventually("message committed", || queue.committed() == 1).await;
    eventually("idle reported", || idle.load(Ordering::Acquire) == 1).await;
    assert_eq!(busy.load(Ordering::Acquire), 1);

    workers.dispose().await;
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn handler_error_rolls_back_and_notifies() {
    let queue = Arc::new(InMemoryQueue::new());
    let id = queue.send(serde_json::json!({}));

    let reports: Arc<Mutex<Vec<(usize, MessageId, String)>>> = Arc::default();
    let system = Arc::new(AtomicUsize::new(0));
    let notifications = {
        let reports = Arc::clone(&reports);
        let system = Arc::clone(&system);
        WorkerNotifications::new()
            .on_user_exception(move |e| {
                reports
                    .lock()
                    .unwrap()
                    .push((e.worker_id, e.message_id, e.error.to_string()));
            })
            .on_system_exception(move |_| {
                system.fetch_add(1, Ordering::AcqRel);
            })
    };

    let handler = Arc::new(Recording {
        fail_first_attempt: true,
        ..Recording::default()
    });
    let workers = collection(worker_config(1), &queue, handler.clone()).with_notifications(notifications);
    workers.start().unwrap();

    eventually("retry to commit", || queue.committed() == 1).await;
    workers.dispose().await;

    assert_eq!(queue.rolled_back(), 1);
    assert_eq!(handler.calls.load(Ordering::Acquire), 2);
    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, 0);
    assert_eq!(reports[0].1, id);
    assert!(reports[0].2.contains("fails"));
    assert_eq!(system.load(Ordering::Acquire), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_panic_is_a_user_error() {
    let queue = Arc::new(InMemoryQueue::new());
    queue.send(serde_json::json!({}));

    let reports: Arc<Mutex<Vec<String>>> = Arc::default();
    let notifications = {
        let reports = Arc::clone(&reports);
        WorkerNotifications::new().on_user_exception(move |e| {
            reports.lock().unwrap().push(e.error.to_string());
        })
    };
    let workers =
        collection(worker_config(1), &queue, Arc::new(Panics)).with_notifications(notifications);
    workers.start().unwrap();

    eventually("a rollback", || queue.rolled_back() >= 1).await;
    assert!(workers.workers()[0].running(), "a panicking handler must not kill the loop");
    workers.dispose().await;

    let reports = reports.lock().unwrap();
    assert!(reports[0].contains("handler bug"));
}

/// Fails the first receive, then behaves.
struct FlakyTransport {
    inner: Arc<InMemoryQueue>,
    failures_left: AtomicUsize,
}

#[async_trait]
impl MessageTransport for FlakyTransport {
    async fn receive(&self, cancel: &CancellationToken) -> Result<Option<ReceivedMessage>> {
        if self
            .failures_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Transport("connection reset".to_string()));
        }
        self.inner.receive(cancel).await
    }

    async fn commit(&self, message: &ReceivedMessage) -> Result<()> {
        self.inner.commit(message).await
    }

    async fn rollback(&self, message: &ReceivedMessage) -> Result<()> {
        self.inner.rollback(message).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn transport_errors_are_reported_and_survived() {
    let queue = Arc::new(InMemoryQueue::new());
    queue.send(serde_json::json!({}));
    let transport = Arc::new(FlakyTransport {
        inner: queue.clone(),
        failures_left: AtomicUsize::new(2),
    });

    let system: Arc<Mutex<Vec<String>>> = Arc::default();
    let notifications = {
        let system = Arc::clone(&system);
        WorkerNotifications::new().on_system_exception(move |e| {
            system.lock().unwrap().push(e.error.to_string());
        })
    };
    let workers = WorkerCollection::new(worker_config(1), transport, Arc::new(Recording::default()))
        .with_queue_wait(fast_poll())
        .with_notifications(notifications);
    workers.start().unwrap();

    eventually("message committed", || queue.committed() == 1).await;
    workers.dispose().await;

    let system = system.lock().unwrap();
    assert_eq!(system.len(), 2);
    assert!(system[0].contains("connection reset"));
}

#[tokio::test(flavor = "multi_thread")]
async fn hooks_run_for_the_matching_outcome() {
    let queue = Arc::new(InMemoryQueue::new());
    queue.send(serde_json::json!({ "label": "ok" }));
    let events: Arc<Mutex<Vec<String>>> = Arc::default();
    let handler = Arc::new(Hooked {
        events: Arc::clone(&events),
    });
    let workers = collection(worker_config(1), &queue, handler);
    workers.start().unwrap();

    eventually("commit", || queue.committed() == 1).await;
    eventually("cleanup", || events.lock().unwrap().len() == 2).await;

    queue.send(serde_json::json!({ "label": "bad", "fail": true }));
    eventually("rollback hooks", || events.lock().unwrap().len() >= 4).await;
    workers.dispose().await;

    let events = events.lock().unwrap();
    assert_eq!(events[0], "commit:ok");
    assert_eq!(events[1], "cleanup:ok");
    assert_eq!(events[2], "rollback:bad");
    assert_eq!(events[3], "cleanup:bad");
    assert!(!events.contains(&"rollback:ok".to_string()));
    assert!(!events.contains(&"commit:bad".to_string()));
}

// ---------------------------------------------------------------------------
// Scheduled dispatch
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn scheduled_dispatch_respects_work_group_limits() {
    let scheduler = Arc::new(TaskScheduler::new(SchedulerConfig {
        max_threads: 4,
        shutdown_timeout: Duration::from_secs(1),
    }));
    let group = scheduler.add_work_group("reports", 2, 0).unwrap();
    scheduler.start().unwrap();

    let queue = Arc::new(InMemoryQueue::new());
    for n in 0..16 {
        queue.send(serde_json::json!({ "n": n }));
    }
    let handler = Arc::new(Recording::with_delay(Duration::from_millis(20)));
    let workers = collection(worker_config(4), &queue, handler.clone())
        .with_task_factory(TaskFactory::new(Arc::clone(&scheduler)), Some(group.clone()));
    workers.start().unwrap();
    assert_eq!(scheduler.subscriber_count(), 1);

    eventually("all messages committed", || queue.committed() == 16).await;
    assert!(workers.stop().await);
    assert!(handler.peak.load(Ordering::Acquire) <= 2);
    assert!(
        handler
            .threads
            .lock()
            .unwrap()
            .iter()
            .all(|t| t.starts_with("workq-scheduler")),
        "scheduled handlers run on the scheduler pool"
    );

    workers.dispose().await;
    assert_eq!(scheduler.subscriber_count(), 0);
    scheduler.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduled_worker_stays_busy_until_its_message_settles() {
    let scheduler = Arc::new(TaskScheduler::new(SchedulerConfig {
        max_threads: 2,
        shutdown_timeout: Duration::from_secs(1),
    }));
    scheduler.start().unwrap();

    let queue = Arc::new(InMemoryQueue::new());
    let handler = Arc::new(Gated::new());
    let workers = collection(worker_config(1), &queue, handler.clone())
        .with_task_factory(TaskFactory::new(Arc::clone(&scheduler)), None);
    workers.start().unwrap();
    assert!(workers.all_workers_are_idle());

    queue.send(serde_json::json!({}));
    eventually("handler to start", || handler.entered.load(Ordering::Acquire) == 1).await;
    assert!(!workers.all_workers_are_idle());
    assert_eq!(workers.workers()[0].idle_status(), IdleStatus::NotIdle);

    // The loop is back to polling, but the message it handed off is not done.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!workers.all_workers_are_idle());
    assert_eq!(workers.in_flight(), 1);

    handler.release.add_permits(1);
    eventually("message committed", || queue.committed() == 1).await;
    eventually("worker idle again", || workers.all_workers_are_idle()).await;
    assert_eq!(workers.workers()[0].idle_status(), IdleStatus::Idle);

    workers.dispose().await;
    scheduler.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_messages_keep_their_heartbeat() {
    let scheduler = Arc::new(TaskScheduler::new(SchedulerConfig {
        max_threads: 2,
        shutdown_timeout: Duration::from_secs(1),
    }));
    let group = scheduler.add_work_group("serial", 1, 1).unwrap();
    scheduler.start().unwrap();

    let queue = Arc::new(InMemoryQueue::new());
    let support = HeartBeatSupport::new(
        queue.clone(),
        HeartBeatSchedule::interval(Duration::from_millis(20)),
        Arc::new(HeartBeatThreadPool::new(1)),
    );
    let handler = Arc::new(Gated::new());
    let workers = collection(worker_config(1), &queue, handler.clone())
        .with_task_factory(TaskFactory::new(Arc::clone(&scheduler)), Some(group.clone()))
        .with_heartbeat(support);
    workers.start().unwrap();

    queue.send(serde_json::json!({ "n": 1 }));
    queue.send(serde_json::json!({ "n": 2 }));
    eventually("second message queued", || group.queued_count() == 1).await;
    assert_eq!(queue.in_flight(), 2);

    // Both claims outlive the window; neither is dead.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let reset = ResetHeartBeat::new(
        queue.clone(),
        HeartBeatConfig {
            window: Duration::from_millis(150),
            reset_limit: 10,
            ..HeartBeatConfig::default()
        },
    );
    assert!(reset.reset(&CancellationToken::new()).await.unwrap().is_empty());

    handler.release.add_permits(2);
    eventually("both messages committed", || queue.committed() == 2).await;
    assert_eq!(queue.resets(), 0);

    workers.dispose().await;
    scheduler.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn collection_outliving_its_scheduler_still_disposes() {
    let scheduler = Arc::new(TaskScheduler::new(SchedulerConfig {
        max_threads: 2,
        shutdown_timeout: Duration::from_millis(200),
    }));
    scheduler.start().unwrap();

    let queue = Arc::new(InMemoryQueue::new());
    let workers = collection(worker_config(2), &queue, Arc::new(Recording::default()))
        .with_task_factory(TaskFactory::new(Arc::clone(&scheduler)), None);
    workers.start().unwrap();
    assert_eq!(scheduler.subscriber_count(), 1);

    scheduler.dispose().await;
    tokio::time::timeout(Duration::from_secs(5), workers.dispose())
        .await
        .expect("dispose finishes without the scheduler");
    assert!(workers.is_disposed());
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduled_collection_needs_a_started_scheduler() {
    let scheduler = Arc::new(TaskScheduler::new(SchedulerConfig {
        max_threads: 2,
        shutdown_timeout: Duration::from_secs(1),
    }));
    let queue = Arc::new(InMemoryQueue::new());
    let workers = collection(worker_config(1), &queue, Arc::new(Recording::default()))
        .with_task_factory(TaskFactory::new(scheduler), None);
    assert!(matches!(workers.start(), Err(Error::NotStarted(_))));
}

// ---------------------------------------------------------------------------
// Stop / pause / dispose
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn stop_lets_in_flight_messages_finish() {
    let queue = Arc::new(InMemoryQueue::new());
    queue.send(serde_json::json!({}));
    let handler = Arc::new(Recording::with_delay(Duration::from_millis(200)));
    let workers = collection(worker_config(1), &queue, handler.clone());
    workers.start().unwrap();

    eventually("handler to start", || handler.running.load(Ordering::Acquire) == 1).await;
    assert!(workers.stop().await);
    assert_eq!(queue.committed(), 1);
    assert_eq!(workers.running_workers(), 0);
    workers.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_cancels_work_that_outlives_the_grace_window() {
    let queue = Arc::new(InMemoryQueue::new());
    queue.send(serde_json::json!({}));
    let mut config = worker_config(1);
    config.stop_timeout = Duration::from_millis(100);
    let workers = collection(config, &queue, Arc::new(Hangs));
    workers.start().unwrap();

    eventually("message claimed", || queue.in_flight() == 1).await;
    assert!(workers.stop().await);
    assert_eq!(queue.rolled_back(), 1);
    assert_eq!(queue.pending(), 1);
    assert_eq!(workers.in_flight(), 0);
    workers.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_gives_up_on_loops_that_ignore_cancellation() {
    struct Blocks;

    #[async_trait]
    impl MessageHandler for Blocks {
        async fn handle(
            &self,
            _message: &ReceivedMessage,
            _context: &MessageContext,
        ) -> std::result::Result<(), BoxError> {
            std::thread::sleep(Duration::from_millis(800));
            Ok(())
        }
    }

    let queue = Arc::new(InMemoryQueue::new());
    queue.send(serde_json::json!({}));
    let mut config = worker_config(1);
    config.stop_timeout = Duration::from_millis(50);
    config.cancel_timeout = Duration::from_millis(50);
    config.abort_workers_on_stop_timeout = true;
    let workers = collection(config, &queue, Arc::new(Blocks));
    workers.start().unwrap();

    eventually("message claimed", || queue.in_flight() == 1).await;
    assert!(!workers.stop().await);
    eventually("aborted loop to exit", || workers.running_workers() == 0).await;
    workers.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn paused_workers_leave_messages_alone() {
    let queue = Arc::new(InMemoryQueue::new());
    let workers = collection(worker_config(2), &queue, Arc::new(Recording::default()));
    workers.start().unwrap();
    workers.pause_workers().unwrap();
    assert!(workers.is_paused());
    tokio::time::sleep(Duration::from_millis(30)).await;

    queue.send(serde_json::json!({}));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.pending(), 1);

    workers.resume_workers().unwrap();
    eventually("message committed", || queue.committed() == 1).await;
    workers.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn force_terminating_one_worker_leaves_the_rest() {
    let queue = Arc::new(InMemoryQueue::new());
    let workers = collection(worker_config(3), &queue, Arc::new(Recording::default()));
    workers.start().unwrap();

    let first = workers.workers()[0].clone();
    tokio::time::timeout(Duration::from_secs(5), first.try_force_terminate())
        .await
        .unwrap();
    assert!(!first.running());
    assert!(first.attempt_to_terminate());
    assert_eq!(workers.running_workers(), 2);

    queue.send(serde_json::json!({}));
    eventually("survivors process work", || queue.committed() == 1).await;
    workers.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn force_terminate_cancels_the_message_in_hand() {
    let queue = Arc::new(InMemoryQueue::new());
    queue.send(serde_json::json!({}));
    let workers = collection(worker_config(1), &queue, Arc::new(WaitsForCancel));
    workers.start().unwrap();

    eventually("message claimed", || queue.in_flight() == 1).await;
    let worker = workers.workers()[0].clone();
    tokio::time::timeout(Duration::from_secs(2), worker.try_force_terminate())
        .await
        .expect("worker exits once its message is cancelled");
    assert!(!worker.running());
    assert_eq!(queue.rolled_back(), 1);
    assert_eq!(queue.pending(), 1);
    assert_eq!(workers.in_flight(), 0);

    workers.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn disposed_collection_refuses_everything() {
    let queue = Arc::new(InMemoryQueue::new());
    let workers = collection(worker_config(1), &queue, Arc::new(Recording::default()));
    workers.start().unwrap();
    assert!(matches!(workers.start(), Err(Error::AlreadyStarted(_))));

    workers.dispose().await;
    workers.dispose().await;
    assert!(workers.is_disposed());
    assert!(matches!(workers.start(), Err(Error::Disposed(_))));
    assert!(matches!(workers.pause_workers(), Err(Error::Disposed(_))));
    assert!(matches!(workers.resume_workers(), Err(Error::Disposed(_))));
}

// ---------------------------------------------------------------------------
// Single poller
// ---------------------------------------------------------------------------

/// Counts receive calls.
struct CountingTransport {
    inner: Arc<InMemoryQueue>,
    receives: AtomicUsize,
}

#[async_trait]
impl MessageTransport for CountingTransport {
    async fn receive(&self, cancel: &CancellationToken) -> Result<Option<ReceivedMessage>> {
        self.receives.fetch_add(1, Ordering::AcqRel);
        self.inner.receive(cancel).await
    }

    async fn commit(&self, message: &ReceivedMessage) -> Result<()> {
        self.inner.commit(message).await
    }

    async fn rollback(&self, message: &ReceivedMessage) -> Result<()> {
        self.inner.rollback(message).await
    }
}

async fn idle_receives(single_poller: bool) -> (usize, Arc<InMemoryQueue>, WorkerCollection) {
    let queue = Arc::new(InMemoryQueue::new());
    let transport = Arc::new(CountingTransport {
        inner: queue.clone(),
        receives: AtomicUsize::new(0),
    });
    let mut config = worker_config(4);
    config.single_poller_when_idle = single_poller;
    let workers = WorkerCollection::new(config, transport.clone(), Arc::new(Recording::default()))
        .with_queue_wait(Arc::new(LinearBackoff::from_steps(vec![Duration::from_millis(40)])));
    workers.start().unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    (transport.receives.load(Ordering::Acquire), queue, workers)
}

#[tokio::test(flavor = "multi_thread")]
async fn single_poller_quiets_an_idle_queue() {
    let (shared, _, all) = idle_receives(false).await;
    all.dispose().await;
    let (single, queue, workers) = idle_receives(true).await;

    assert!(
        single * 2 < shared,
        "single poller made {single} receives, all pollers {shared}"
    );

    // Work arriving wakes everyone up again.
    for n in 0..8 {
        queue.send(serde_json::json!({ "n": n }));
    }
    eventually("messages committed", || queue.committed() == 8).await;
    workers.dispose().await;
}

// ---------------------------------------------------------------------------
// Heartbeats
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_runs_while_a_message_is_processed() {
    let queue = Arc::new(InMemoryQueue::new());
    queue.send(serde_json::json!({}));
    let support = HeartBeatSupport::new(
        queue.clone(),
        HeartBeatSchedule::interval(Duration::from_millis(20)),
        Arc::new(HeartBeatThreadPool::new(1)),
    );
    let handler = Arc::new(WatchesHeartbeat {
        observed: Mutex::new(Vec::new()),
    });
    let workers = collection(worker_config(1), &queue, handler.clone()).with_heartbeat(support.clone());
    workers.start().unwrap();
    assert!(support.pool().started());

    eventually("message committed", || queue.committed() == 1).await;
    workers.dispose().await;
    assert!(matches!(support.pool().start(), Err(Error::Disposed(_))));

    let observed = handler.observed.lock().unwrap();
    let (dequeued, status) = observed[0];
    let status = status.unwrap();
    assert!(status.last_heartbeat.unwrap() > dequeued.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn transports_without_heartbeat_get_none() {
    let queue = Arc::new(InMemoryQueue::without_heartbeat());
    queue.send(serde_json::json!({}));
    let support = HeartBeatSupport::new(
        queue.clone(),
        HeartBeatSchedule::interval(Duration::from_millis(20)),
        Arc::new(HeartBeatThreadPool::new(1)),
    );
    let handler = Arc::new(WatchesHeartbeat {
        observed: Mutex::new(Vec::new()),
    });
    let workers = collection(worker_config(1), &queue, handler.clone()).with_heartbeat(support.clone());
    workers.start().unwrap();

    eventually("message committed", || queue.committed() == 1).await;
    workers.dispose().await;
    assert!(!support.pool().started());
    assert_eq!(handler.observed.lock().unwrap()[0], (None, None));
}
