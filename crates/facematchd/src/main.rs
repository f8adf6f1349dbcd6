use anyhow::Result;
use facematch_core::{Config, FacePipeline, OnnxEncoder, ScrfdDetector};
use tracing_subscriber::EnvFilter;

mod dbus_interface;
mod engine;
mod request;
mod response;

use dbus_interface::{FaceMatchService, ServiceInfo, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facematchd starting");

    let config = Config::from_env();
    tracing::info!(
        model_dir = %config.model_dir.display(),
        detection_mode = %config.detection_mode,
        distance_threshold = config.distance_threshold,
        min_confidence = config.min_confidence,
        selection = %config.selection,
        workers = config.max_workers,
        "configuration loaded"
    );

    let detector_path = config.detector_model_path();
    let encoder_path = config.encoder_model_path();
    let engine = engine::spawn_engine(
        config.max_workers,
        config.queue_depth,
        config.request_timeout,
        |worker| {
            tracing::debug!(worker, "loading models");
            let detector =
                ScrfdDetector::load(&detector_path, config.detection_mode, config.intra_threads)?;
            let encoder = OnnxEncoder::load(&encoder_path, config.intra_threads)?
                .with_input_size(config.encoder_input_size)
                .with_channel_order(config.encoder_channel_order);
            Ok(FacePipeline::new(detector, encoder)
                .with_selection(config.selection)
                .with_policy(config.policy()))
        },
    )?;

    let service = FaceMatchService::new(engine, ServiceInfo::from_config(&config));
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facematchd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facematchd shutting down");

    Ok(())
}
