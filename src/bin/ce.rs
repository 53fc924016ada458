//! ce CLI: run the compute engine worker pool.

use anyhow::Context as _;
use compute_engine::config::{CeConfiguration, EnvWorkerCountProvider, Settings, WorkerCountProvider};
use compute_engine::listener::{ExecutionListener, Listeners, MetricsListener};
use compute_engine::model::{Component, REPORT_TYPE, Task, TaskResult};
use compute_engine::pool::WorkerPool;
use compute_engine::processor::{ProcessError, TaskContext, TaskProcessor, TaskProcessorRepository};
use compute_engine::queue::InMemoryQueue;
use compute_engine::telemetry::{Profiler, TelemetryConfig, init_telemetry, metrics};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "ce", about = "Compute engine worker pool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool until Ctrl-C
    Serve {
        /// TOML settings file
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Number of demo report tasks to enqueue at startup
        #[arg(long, default_value_t = 0)]
        demo_tasks: usize,
        /// OTLP gRPC endpoint (falls back to OTEL_ENDPOINT)
        #[arg(long)]
        otel_endpoint: Option<String>,
        /// Use ce.worker_count instead of re-reading CE_WORKER_COUNT
        #[arg(long)]
        static_worker_count: bool,
    },
    /// Print the resolved configuration
    Config {
        /// TOML settings file
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Use ce.worker_count instead of re-reading CE_WORKER_COUNT
        #[arg(long)]
        static_worker_count: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            settings,
            demo_tasks,
            otel_endpoint,
            static_worker_count,
        } => cmd_serve(settings, demo_tasks, otel_endpoint, static_worker_count).await,
        Command::Config {
            settings,
            static_worker_count,
        } => cmd_config(settings.as_deref(), static_worker_count),
    }
}

fn load_configuration(settings: Option<&Path>, static_worker_count: bool) -> anyhow::Result<CeConfiguration> {
    let settings = match settings {
        Some(path) => Settings::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::new(),
    }
    .with_env_overrides();
    let provider: Option<Arc<dyn WorkerCountProvider>> = if static_worker_count {
        None
    } else {
        Some(Arc::new(EnvWorkerCountProvider::new()))
    };
    Ok(CeConfiguration::new(&settings, provider))
}

async fn cmd_serve(
    settings: Option<PathBuf>,
    demo_tasks: usize,
    otel_endpoint: Option<String>,
    static_worker_count: bool,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: otel_endpoint.or_else(|| std::env::var("OTEL_ENDPOINT").ok()),
        service_name: "compute-engine".to_string(),
    })?;

    let configuration = Arc::new(load_configuration(settings.as_deref(), static_worker_count)?);

    let queue = Arc::new(InMemoryQueue::new());
    for n in 0..demo_tasks {
        queue.submit(
            Task::new(REPORT_TYPE)
                .main_component(Component::new(format!("demo-{n}")).key(format!("demo-project-{n}")))
                .characteristic("branch", "main"),
        );
    }

    let processors = TaskProcessorRepository::new().with(Arc::new(DemoReportProcessor))?;

    let meter = metrics::meter();
    let metrics_listener: Arc<dyn ExecutionListener> = Arc::new(MetricsListener::new(&meter));
    let listeners = Listeners::new(vec![metrics_listener]);
    let mut pool = WorkerPool::start(
        Arc::clone(&configuration),
        queue.clone(),
        Arc::new(processors),
        listeners,
        Profiler::new(&meter),
    )?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    let stopped = tokio::task::spawn_blocking(move || pool.stop_gracefully()).await?;
    info!(
        stopped,
        finished = queue.history().len(),
        pending = queue.pending_count(),
        "compute engine stopped"
    );
    Ok(())
}

fn cmd_config(settings: Option<&Path>, static_worker_count: bool) -> anyhow::Result<()> {
    let configuration = load_configuration(settings, static_worker_count)?;
    println!("worker count:              {}", configuration.worker_count());
    println!("worker max count:          {}", configuration.worker_max_count());
    println!("dynamic worker count:      {}", configuration.has_dynamic_worker_count());
    println!("queue polling delay:       {:?}", configuration.queue_polling_delay());
    println!("clean tasks initial delay: {:?}", configuration.clean_tasks_initial_delay());
    println!("clean tasks delay:         {:?}", configuration.clean_tasks_delay());
    println!("graceful stop timeout:     {:?}", configuration.graceful_stop_timeout());
    Ok(())
}

/// Pretends to process an analysis report in a few interruptible steps.
struct DemoReportProcessor;

impl TaskProcessor for DemoReportProcessor {
    fn handled_types(&self) -> &[&str] {
        &[REPORT_TYPE]
    }

    fn process(&self, task: &Task, ctx: &TaskContext<'_>) -> Result<Option<TaskResult>, ProcessError> {
        for _ in 0..5 {
            ctx.check_interrupted()?;
            std::thread::sleep(Duration::from_millis(200));
        }
        Ok(Some(TaskResult::new(serde_json::json!({
            "project": task.project_key(),
            "worker": ctx.worker().ordinal,
        }))))
    }
}
