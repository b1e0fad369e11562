use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use event_log::KafkaProducer;
use frame_bus::RedisFrameBus;
use trinetra_config_data::Tuning;
use trinetra_infer::{IouTracker, NullDetector, NullEmbedder, Worker, WorkerConfig};
use trinetra_types::CameraKind;

const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(author, version, about = "TRINETRA inference worker")]
struct Cli {
    /// Static per-camera configuration file.
    #[clap(long, env = "CAMERAS_CONFIG")]
    cameras_config: std::path::PathBuf,

    /// Frame bus backing store.
    #[clap(long, env = "FRAME_BUS_URL", default_value = "redis://localhost:6379")]
    frame_bus_url: String,

    /// Event log brokers.
    #[clap(long, env = "EVENT_LOG_BOOTSTRAP", default_value = "localhost:9092")]
    event_log_bootstrap: String,

    /// Port for /health and /metrics.
    #[clap(long, env = "METRICS_PORT", default_value = "8002")]
    metrics_port: u16,

    /// Name of this worker within the consumer group. Defaults to pid-based.
    #[clap(long)]
    consumer_name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let args = Cli::parse();
    let tuning = Tuning::from_env();

    let recorder = telemetry::install_metrics_recorder()?;
    let health = telemetry::HealthState::new();
    telemetry::serve_observability(args.metrics_port, health.clone(), recorder).await?;
    trinetra_infer::describe_metrics();

    let config = trinetra_config_data::parse_config_file(&args.cameras_config)
        .with_context(|| format!("loading {}", args.cameras_config.display()))?;

    let bus = RedisFrameBus::connect(&args.frame_bus_url, tuning.frame_buffer_maxlen)
        .await
        .with_context(|| format!("connecting to frame bus at {}", args.frame_bus_url))?;
    let producer = KafkaProducer::connect(&args.event_log_bootstrap)
        .with_context(|| format!("connecting to event log at {}", args.event_log_bootstrap))?;
    health.mark_upstream_ready();

    let billing_cameras: HashSet<_> = config
        .cameras
        .iter()
        .filter(|c| c.kind == CameraKind::Billing)
        .map(|c| c.id.clone())
        .collect();
    let consumer_name = args
        .consumer_name
        .unwrap_or_else(|| format!("worker-{}", std::process::id()));

    // Operator backends are deployment-specific implementations of the
    // Detector/Embedder traits. Without one linked in, the worker runs the
    // null operators, which keeps the pipeline flowing for bring-up.
    tracing::warn!("no operator backend linked, running null detector/embedder");

    let worker = Worker::new(
        Arc::new(bus),
        Arc::new(producer),
        Arc::new(NullDetector),
        Arc::new(NullEmbedder),
        Box::new(IouTracker::new()),
        WorkerConfig {
            cameras: config.cameras.iter().map(|c| c.id.clone()).collect(),
            billing_cameras,
            billing_topic: config.billing_detections_topic.clone(),
            batch_size: tuning.batch_size,
            batch_timeout: Duration::from_millis(tuning.batch_timeout_ms),
            consumer_name,
        },
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    health.set_main_loop_running(true);
    let handle = tokio::spawn(worker.run(shutdown_rx));
    tracing::info!("inference worker running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");
    health.set_main_loop_running(false);
    shutdown_tx.send(true).ok();
    match tokio::time::timeout(DRAIN_DEADLINE, handle).await {
        Ok(join) => join??,
        Err(_) => tracing::warn!("drain deadline exceeded, exiting"),
    }
    Ok(())
}
