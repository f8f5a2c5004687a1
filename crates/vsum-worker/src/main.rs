//! Pipeline worker binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vsum_pipeline::{Dispatcher, Orchestrator, PipelineConfig};
use vsum_queue::JobQueue;
use vsum_store::{JobStore, RedisJobStore};
use vsum_worker::{build_registry, JobExecutor, WorkerConfig};

fn init_tracing() -> anyhow::Result<()> {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("vsum=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let worker_config = WorkerConfig::from_env();
    let pipeline_config = PipelineConfig::from_env();
    info!("Worker config: {:?}", worker_config);
    info!("Pipeline config: {:?}", pipeline_config);

    if let Some(port) = worker_config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Metrics exporter listening on port {}", port);
    }

    let store: Arc<dyn JobStore> =
        Arc::new(RedisJobStore::from_env().context("Failed to create job store")?);
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(JobQueue::from_env().context("Failed to create dispatch queue")?);
    let queue = JobQueue::from_env().context("Failed to create job queue")?;

    let registry = build_registry(&worker_config, &pipeline_config)?;
    let orchestrator = Orchestrator::new(store, dispatcher, pipeline_config).with_executors(registry);

    let executor = Arc::new(JobExecutor::new(worker_config, queue, orchestrator));

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_executor.shutdown();
    });

    executor.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize tracing: {}", e);
        std::process::exit(1);
    }

    info!("Starting vsum-worker");

    if let Err(e) = run().await {
        error!("Worker error: {:#}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}
