//! workq CLI: runs the engine end-to-end against the in-memory transport.

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use workq::config::Config;
use workq::error::BoxError;
use workq::heartbeat::{HeartBeatSchedule, HeartBeatSupport, ResetHeartBeat, ResetHeartBeatMonitor};
use workq::memory::InMemoryQueue;
use workq::model::ReceivedMessage;
use workq::scheduler::{TaskFactory, TaskScheduler};
use workq::telemetry::{TelemetryConfig, init_telemetry};
use workq::transport::MessageHandler;
use workq::worker::{LinearBackoff, MessageContext, WorkerCollection, WorkerNotifications};

#[derive(Parser)]
#[command(name = "workq", about = "Message-queue concurrency engine demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push messages through a worker collection and report the outcome
    Run {
        /// Messages to enqueue
        #[arg(long, default_value_t = 100)]
        messages: usize,
        /// Simulated handler time per message, in milliseconds
        #[arg(long, default_value_t = 50)]
        work_ms: u64,
        /// Fail every Nth message (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: u64,
        /// Dispatch through the scheduler instead of processing inline
        #[arg(long)]
        scheduled: bool,
        /// Work group to admit messages under (implies --scheduled)
        #[arg(long)]
        group: Option<String>,
        /// Concurrency level of the work group
        #[arg(long, default_value_t = 2)]
        concurrency: usize,
        /// Queue depth of the work group
        #[arg(long, default_value_t = 0)]
        queue_size: usize,
    },
    /// Print the configuration loaded from the environment
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Config => cmd_config(&config),
        Command::Run {
            messages,
            work_ms,
            fail_every,
            scheduled,
            group,
            concurrency,
            queue_size,
        } => {
            let _guard = init_telemetry(TelemetryConfig {
                endpoint: config.otel_endpoint.clone(),
                service_name: "workq".to_string(),
            })?;
            let run = RunArgs {
                messages,
                work: Duration::from_millis(work_ms),
                fail_every,
                scheduled: scheduled || group.is_some(),
                group,
                concurrency,
                queue_size,
            };
            cmd_run(config, run).await
        }
    }
}

fn cmd_config(config: &Config) -> anyhow::Result<()> {
    let connection = match &config.connection {
        Some(secret) if !secret.expose_secret().is_empty() => "<set>",
        _ => "<unset>",
    };
    println!("connection:        {connection}");
    println!("workers:           {}", config.worker.worker_count);
    println!("stop timeout:      {:?}", config.worker.stop_timeout);
    println!("cancel timeout:    {:?}", config.worker.cancel_timeout);
    println!("single poller:     {}", config.worker.single_poller_when_idle);
    println!("scheduler threads: {}", config.scheduler.max_threads);
    println!(
        "heartbeat:         {} ({}, window {:?})",
        config.heartbeat.enabled, config.heartbeat.schedule, config.heartbeat.window
    );
    println!("poll back-off:     {:?}", config.queue_wait.backoff);
    Ok(())
}

struct RunArgs {
    messages: usize,
    work: Duration,
    fail_every: u64,
    scheduled: bool,
    group: Option<String>,
    concurrency: usize,
    queue_size: usize,
}

struct DemoHandler {
    work: Duration,
    fail_every: u64,
    seen: AtomicU64,
}

#[async_trait]
impl MessageHandler for DemoHandler {
    async fn handle(
        &self,
        message: &ReceivedMessage,
        context: &MessageContext,
    ) -> Result<(), BoxError> {
        let n = self.seen.fetch_add(1, Ordering::AcqRel) + 1;
        tokio::select! {
            _ = context.cancelled() => return Err("cancelled".into()),
            _ = tokio::time::sleep(self.work) => {}
        }
        if self.fail_every > 0 && n % self.fail_every == 0 {
            return Err(format!("simulated failure for message {}", message.id).into());
        }
        Ok(())
    }
}

async fn cmd_run(config: Config, args: RunArgs) -> anyhow::Result<()> {
    let queue = Arc::new(InMemoryQueue::new());
    for n in 0..args.messages {
        queue.send(serde_json::json!({ "n": n }));
    }

    let handler = Arc::new(DemoHandler {
        work: args.work,
        fail_every: args.fail_every,
        seen: AtomicU64::new(0),
    });
    let failures = Arc::new(AtomicU64::new(0));
    let notifications = {
        let failures = Arc::clone(&failures);
        WorkerNotifications::new().on_user_exception(move |_| {
            failures.fetch_add(1, Ordering::AcqRel);
        })
    };

    let mut collection = WorkerCollection::new(config.worker.clone(), queue.clone(), handler)
        .with_queue_wait(Arc::new(LinearBackoff::new(&config.queue_wait)))
        .with_notifications(notifications);

    let scheduler = Arc::new(TaskScheduler::new(config.scheduler.clone()));
    if args.scheduled {
        let group = match &args.group {
            Some(name) => Some(scheduler.add_work_group(name, args.concurrency, args.queue_size)?),
            None => None,
        };
        scheduler.start()?;
        collection = collection.with_task_factory(TaskFactory::new(Arc::clone(&scheduler)), group);
    }

    let monitor_cancel = CancellationToken::new();
    let monitor = if config.heartbeat.enabled {
        collection =
            collection.with_heartbeat(HeartBeatSupport::from_config(queue.clone(), &config.heartbeat)?);
        let reset = Arc::new(ResetHeartBeat::new(queue.clone(), config.heartbeat.clone()));
        let schedule = HeartBeatSchedule::from_str(&config.heartbeat.schedule)?;
        Some(
            ResetHeartBeatMonitor::new(reset, schedule)
                .on_reset(|output| println!("reset {} lapsed message(s)", output.len()))
                .spawn(monitor_cancel.clone()),
        )
    } else {
        None
    };

    let started = std::time::Instant::now();
    collection.start()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        if queue.pending() == 0 && queue.in_flight() == 0 {
            break;
        }
        tokio::select! {
            _ = &mut ctrl_c => {
                println!("interrupted, stopping");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    collection.dispose().await;
    monitor_cancel.cancel();
    if let Some(monitor) = monitor {
        monitor.await?;
    }
    scheduler.dispose().await;

    println!(
        "processed {} message(s) in {:.2?}: {} committed, {} rolled back ({} handler failures), {} pending",
        args.messages,
        started.elapsed(),
        queue.committed(),
        queue.rolled_back(),
        failures.load(Ordering::Acquire),
        queue.pending(),
    );
    Ok(())
}
