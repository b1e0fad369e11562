use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use event_log::{KafkaConsumer, KafkaProducer};
use sim_search::QdrantSearch;
use trinetra_config_data::Tuning;
use trinetra_resolve::{Resolver, ResolverConfig};
use trinetra_types::DETECTIONS_TOPIC;

const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(author, version, about = "TRINETRA identity resolver")]
struct Cli {
    /// Static per-camera configuration file.
    #[clap(long, env = "CAMERAS_CONFIG")]
    cameras_config: std::path::PathBuf,

    /// Event log brokers.
    #[clap(long, env = "EVENT_LOG_BOOTSTRAP", default_value = "localhost:9092")]
    event_log_bootstrap: String,

    /// Vector search endpoint.
    #[clap(long, env = "SIM_SEARCH_URL", default_value = "http://localhost:6333")]
    sim_search_url: String,

    /// Gallery collection name on the vector search backend.
    #[clap(long, env = "SIM_SEARCH_COLLECTION", default_value = "gallery")]
    sim_search_collection: String,

    /// Port for /health and /metrics.
    #[clap(long, env = "METRICS_PORT", default_value = "8003")]
    metrics_port: u16,

    /// Consumer group shared by all resolver instances.
    #[clap(long, default_value = "identity-resolvers")]
    consumer_group: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let args = Cli::parse();
    let tuning = Tuning::from_env();

    let recorder = telemetry::install_metrics_recorder()?;
    let health = telemetry::HealthState::new();
    telemetry::serve_observability(args.metrics_port, health.clone(), recorder).await?;
    trinetra_resolve::describe_metrics();

    let config = trinetra_config_data::parse_config_file(&args.cameras_config)
        .with_context(|| format!("loading {}", args.cameras_config.display()))?;

    let mut topics = vec![DETECTIONS_TOPIC];
    if let Some(billing_topic) = config.billing_detections_topic.as_deref() {
        topics.push(billing_topic);
    }
    let consumer = KafkaConsumer::connect(&args.event_log_bootstrap, &args.consumer_group, &topics)
        .with_context(|| format!("connecting to event log at {}", args.event_log_bootstrap))?;
    let producer = KafkaProducer::connect(&args.event_log_bootstrap)?;
    let search = QdrantSearch::new(&args.sim_search_url, &args.sim_search_collection)?;
    health.mark_upstream_ready();

    let camera_kinds = config
        .cameras
        .iter()
        .map(|c| (c.id.clone(), c.kind))
        .collect();
    let resolver = Resolver::new(
        Arc::new(search),
        Arc::new(producer),
        Box::new(consumer),
        ResolverConfig::new(tuning, camera_kinds, config.travel_times.clone()),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    health.set_main_loop_running(true);
    let handle = tokio::spawn(resolver.run(shutdown_rx));
    tracing::info!("identity resolver running");

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
