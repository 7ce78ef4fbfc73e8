use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod analytics;
mod api;
mod camera;
mod config;
mod frame;
mod pipeline;
mod relay;
mod sink;
#[cfg(test)]
mod testing;

use api::AppState;
use camera::{CaptureDevice, DeviceFactory, OpenCvCamera};
use config::Config;
use pipeline::{PipelineSettings, Supervisor};
use relay::Relay;
use sink::SnapshotStore;

const POLL_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("homecam=debug".parse()?))
        .init();

    let config = Config::load()?;
    let settings = PipelineSettings::from_config(&config);
    let detectors = analytics::build_detectors(&config.detectors);
    tracing::info!(
        device = %config.capture.device,
        fps = settings.fps,
        detectors = detectors.len(),
        "loaded configuration"
    );

    let device = config.capture.device.clone();
    let device_factory: DeviceFactory =
        Arc::new(move || Box::new(OpenCvCamera::new(device.clone())) as Box<dyn CaptureDevice>);

    let alarm_output = Relay::new(config.pipeline.output_retain);
    let preview_output = Relay::new(config.pipeline.output_retain);
    let mut supervisor = Supervisor::new(
        settings,
        device_factory,
        detectors,
        vec![alarm_output.clone(), preview_output.clone()],
    );
    supervisor.start()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let preview = SnapshotStore::new();
    let alarms = SnapshotStore::new();
    let monitor_handle = sink::spawn_monitor(alarm_output, alarms.clone(), Arc::clone(&shutdown));
    let feed_handle = sink::spawn_preview_feed(preview_output, preview.clone(), Arc::clone(&shutdown));

    let state = AppState::new(preview, alarms);
    let port = config.http.port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = api::start_server(state, port).await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let mut reported_resolution = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = interval.tick() => {
                let resolution = tokio::task::block_in_place(|| supervisor.resolution());
                if !supervisor.is_running() {
                    tracing::error!("camera pipeline stopped unexpectedly");
                    break;
                }
                if let Some(resolution) = resolution.filter(|r| Some(*r) != reported_resolution) {
                    tracing::info!(%resolution, "camera streaming");
                    reported_resolution = Some(resolution);
                }
            }
        }
    }

    tokio::task::block_in_place(|| supervisor.close());
    shutdown.store(true, Ordering::Relaxed);
    server_handle.abort();
    for handle in [monitor_handle, feed_handle] {
        if let Err(e) = handle.await {
            tracing::error!("consumer task failed: {}", e);
        }
    }
    tracing::info!("shutdown complete");

    Ok(())
}
