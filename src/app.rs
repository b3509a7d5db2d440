use crate::{
    config::Config,
    detector::Detector,
    grounding_dino::GroundingDinoDetector,
    model_files::ensure_model_files,
    server::HttpServer,
    telemetry::Metrics,
};
use anyhow::Context;
use std::sync::Arc;
use tokio::{signal, sync::broadcast};

/// Fetches missing model files, builds the detector once, then serves until
/// SIGINT or SIGTERM.
pub async fn start_app(config: Config) -> anyhow::Result<()> {
    ensure_model_files(&config.model)
        .await
        .context("failed to prepare model files")?;

    let model_config = config.model.clone();
    let detection_config = config.detection.clone();
    let detector: Arc<dyn Detector> = match tokio::task::spawn_blocking(move || {
        GroundingDinoDetector::new(&model_config, &detection_config)
    })
    .await?
    {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::error!("Failed to initialize detector: {:?}", e);
            return Err(e.into());
        }
    };

    let metrics = Arc::new(Metrics::new()?);
    let server = HttpServer::new(detector, metrics, &config.server).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let server_handle = server.run(shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
