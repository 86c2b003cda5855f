use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use foreman_core::agent::{Agent, AgentRole};
use foreman_core::config::CoordinationConfig;
use foreman_core::message::{MessagePayload, ReportedStatus, TaskResponse};
use foreman_storage::{
    open_store, AckDisposition, AgentRegistry, EventBus, MessageQueue, StoreConfig,
    SupervisorCoordinator, TaskSpec,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Durable message passing and task delegation for agent teams")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Database URL for the coordination store
    #[arg(long, global = true, default_value = "sqlite:foreman.db")]
    database_url: String,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory for daily rolling log files
    #[arg(long, global = true, default_value = ".foreman/logs")]
    log_dir: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor loop until interrupted
    Supervise {
        /// Seconds between inbox and maintenance passes
        #[arg(long, default_value = "30")]
        interval_seconds: u64,
    },
    /// Print a JSON snapshot of agents, messages, and tasks
    Status,
    /// Walk a scripted delegation round trip with in-process workers
    Demo {
        /// Number of workers enrolled for the walkthrough
        #[arg(long, default_value = "3")]
        workers: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing with both console and file logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    std::fs::create_dir_all(&args.log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, "foreman.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter.clone()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter),
        )
        .init();

    info!("Starting Foreman supervisor");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", args.database_url);

    let store = open_store(&StoreConfig {
        database_url: args.database_url.clone(),
        ..StoreConfig::default()
    })
    .await;

    let config = CoordinationConfig::default();
    let events = EventBus::default();
    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&store),
        config.clone(),
        events.clone(),
    ));
    let queue = Arc::new(MessageQueue::new(
        Arc::clone(&store),
        config.clone(),
        events.clone(),
    ));
    let coordinator = SupervisorCoordinator::new(
        store,
        Arc::clone(&registry),
        Arc::clone(&queue),
        config,
        events.clone(),
    );

    match args.command {
        Command::Supervise { interval_seconds } => {
            run_supervise(&coordinator, interval_seconds).await
        }
        Command::Status => print_status(&coordinator).await,
        Command::Demo { workers } => {
            run_demo(&coordinator, &registry, &queue, &events, workers).await
        }
    }
}

/// Periodic supervisor loop: drain the inbox and run maintenance until
/// interrupted.
async fn run_supervise(coordinator: &SupervisorCoordinator, interval_seconds: u64) -> Result<()> {
    coordinator.start().await?;

    // A zero interval would busy-spin
    let period = Duration::from_secs(interval_seconds.max(1));
    let mut ticker = tokio::time::interval(period);
    info!("Supervising every {}s, Ctrl-C to stop", period.as_secs());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let handled = coordinator.process_incoming().await?;
                let report = coordinator.run_maintenance().await?;
                if handled > 0 || report.reaped_claims > 0 || report.reconciled_tasks > 0 {
                    info!(
                        "Pass complete: {} messages handled, {} claims reaped, {} tasks reconciled",
                        handled, report.reaped_claims, report.reconciled_tasks
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                coordinator.shutdown().await?;
                return Ok(());
            }
        }
    }
}

/// One-shot snapshot of coordination state as pretty JSON.
async fn print_status(coordinator: &SupervisorCoordinator) -> Result<()> {
    let statistics = coordinator.statistics().await?;
    println!("{}", serde_json::to_string_pretty(&statistics)?);
    Ok(())
}

/// Scripted walkthrough: enroll synthetic workers, delegate one task to
/// each, then play the worker side of the exchange and drive the reports
/// back through the supervisor inbox.
async fn run_demo(
    coordinator: &SupervisorCoordinator,
    registry: &AgentRegistry,
    queue: &MessageQueue,
    events: &EventBus,
    workers: u32,
) -> Result<()> {
    coordinator.start().await?;

    let mut feed = events.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = feed.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("event: {json}"),
                Err(_) => println!("event: {event}"),
            }
        }
    });

    for index in 1..=workers {
        let worker = Agent::builder()
            .id(format!("demo-worker-{index}"))
            .role(AgentRole::Worker)
            .capability("demo")
            .max_concurrent_tasks(2)
            .build()?;
        registry.register(worker).await?;
    }

    for index in 1..=workers {
        let outcome = coordinator
            .assign_task(TaskSpec {
                task_type: "demo".into(),
                description: format!("Demo workload {index}"),
                parameters: serde_json::json!({ "round": index }),
                required_capabilities: vec!["demo".into()],
                ..TaskSpec::default()
            })
            .await?;
        match outcome {
            Some(task) => println!(
                "delegated task {} to {}",
                task.id,
                task.assigned_agent.as_deref().unwrap_or("unassigned")
            ),
            None => println!("no worker free for demo workload {index}"),
        }
    }

    for index in 1..=workers {
        let worker_id = format!("demo-worker-{index}");
        for message in queue.receive(&worker_id, 8).await? {
            if let MessagePayload::TaskRequest(request) = &message.payload {
                let progress = message.response_to(
                    &worker_id,
                    MessagePayload::TaskResponse(TaskResponse {
                        task_id: request.task_id,
                        status: ReportedStatus::InProgress,
                        progress: Some(0.5),
                        result: None,
                        error_message: None,
                        next_steps: None,
                    }),
                )?;
                queue.send(progress).await?;

                let completed = message.response_to(
                    &worker_id,
                    MessagePayload::TaskResponse(TaskResponse {
                        task_id: request.task_id,
                        status: ReportedStatus::Completed,
                        progress: Some(1.0),
                        result: Some(serde_json::json!({ "outcome": "demo complete" })),
                        error_message: None,
                        next_steps: None,
                    }),
                )?;
                queue.send(completed).await?;
            }
            queue
                .ack(&worker_id, message.id, AckDisposition::Processed)
                .await?;
        }
    }

    while coordinator.process_incoming().await? > 0 {}

    let report = coordinator.run_maintenance().await?;
    info!(
        "Maintenance pass: {} claims reaped, {} messages expired",
        report.reaped_claims, report.expired_messages
    );

    let statistics = coordinator.statistics().await?;
    println!("{}", serde_json::to_string_pretty(&statistics)?);

    coordinator.shutdown().await?;
    // Let the printer flush the tail of the event feed before exiting
    tokio::time::sleep(Duration::from_millis(100)).await;
    printer.abort();
    Ok(())
}
