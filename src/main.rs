use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use station_recorder::api::{self, AppState};
use station_recorder::camera::{CameraSelector, SystemProbe};
use station_recorder::config::Config;
use station_recorder::session::SessionRegistry;
use station_recorder::uploader::{FlatFileSessionLog, S3Store, UploadPipeline};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));

    if config.service.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn init_metrics(config: &Config) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], config.service.metrics_port).into();
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus metrics exporter")?;
    info!(port = config.service.metrics_port, "Metrics exporter listening");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    init_tracing(&config);
    init_metrics(&config)?;

    info!(
        service = %config.service.name,
        bucket = %config.upload.bucket,
        recordings_root = %config.recording.root,
        "Starting station recorder"
    );

    let probe = Arc::new(SystemProbe::new(config.recording.probe_bin.clone()));
    let selector = Arc::new(CameraSelector::new(&config.cameras, probe));
    let registry = Arc::new(SessionRegistry::new(
        config.recording.clone(),
        selector.clone(),
    ));

    let store = Arc::new(S3Store::new(&config.upload).await);
    let log = Arc::new(FlatFileSessionLog::new(config.upload.session_data_path()));
    let pipeline = Arc::new(UploadPipeline::new(
        &config.recording,
        &config.upload,
        store,
        log,
    ));

    let state = AppState {
        registry,
        selector,
        pipeline,
    };

    let api_config = config.api.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = api::start_api_server(state, &api_config).await {
            error!(error = %e, "API server failed");
        }
    });

    shutdown_signal().await;
    info!("Shutdown signal received, stopping");
    server.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
