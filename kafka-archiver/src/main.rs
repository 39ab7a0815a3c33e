use anyhow::{Context, Result};
use axum::{routing::get, Router};
use futures::future::ready;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use kafka_archiver::{config::Config, service::ArchiverService};

pub async fn index() -> &'static str {
    "kafka archiver service"
}

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(config: &Config) -> JoinHandle<()> {
    let recorder_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        );

    let bind = config.bind_address();

    tokio::task::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .expect("failed to bind metrics server");
        axum::serve(listener, router)
            .await
            .expect("failed to start serving metrics");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    info!("Starting Kafka Archiver service");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    let server_handle = start_server(&config);
    info!("Started metrics server on {}", config.bind_address());

    let service = ArchiverService::new(config)
        .await
        .context("Failed to create Kafka Archiver service. Check your Kafka connection and S3 configuration.")?;

    // Runs until shutdown
    service.run().await?;

    server_handle.abort();

    Ok(())
}
