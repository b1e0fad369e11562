use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use frame_bus::{FrameBus, RedisFrameBus};
use trinetra_config_data::Tuning;

/// How long in-flight camera pipelines get to wind down on shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(author, version, about = "TRINETRA stream ingestor")]
struct Cli {
    /// Static per-camera configuration file.
    #[clap(long, env = "CAMERAS_CONFIG")]
    cameras_config: std::path::PathBuf,

    /// Frame bus backing store.
    #[clap(long, env = "FRAME_BUS_URL", default_value = "redis://localhost:6379")]
    frame_bus_url: String,

    /// Port for /health and /metrics.
    #[clap(long, env = "METRICS_PORT", default_value = "8001")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let args = Cli::parse();
    let tuning = Tuning::from_env();

    let recorder = telemetry::install_metrics_recorder()?;
    let health = telemetry::HealthState::new();
    telemetry::serve_observability(args.metrics_port, health.clone(), recorder).await?;
    trinetra_ingest::describe_metrics();

    let config = trinetra_config_data::parse_config_file(&args.cameras_config)
        .with_context(|| format!("loading {}", args.cameras_config.display()))?;

    let bus = RedisFrameBus::connect(&args.frame_bus_url, tuning.frame_buffer_maxlen)
        .await
        .with_context(|| format!("connecting to frame bus at {}", args.frame_bus_url))?;
    health.mark_upstream_ready();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let bus: Arc<dyn FrameBus> = Arc::new(bus);
    let pipelines = trinetra_ingest::spawn_cameras(&config.cameras, bus, shutdown_rx);
    health.set_main_loop_running(true);
    tracing::info!(cameras = pipelines.len(), "ingestor running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");
    health.set_main_loop_running(false);
    shutdown_tx.send(true).ok();

    let drain = async {
        for pipeline in pipelines {
            let _ = pipeline.await;
        }
    };
    if tokio::time::timeout(DRAIN_DEADLINE, drain).await.is_err() {
        tracing::warn!("drain deadline exceeded, exiting with pipelines still busy");
    }
    Ok(())
}
