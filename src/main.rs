//! Demo: run the synthetic RGB-D sequence through the dense-mapping pipeline.
//!
//! Usage: `rust_dense_mapping [config.toml]`

use std::thread;

use anyhow::{Context, Result};
use tracing::info;

use rust_dense_mapping::io::{SyntheticSensor, SyntheticSensorConfig};
use rust_dense_mapping::{PipelineConfig, PipelineManager, PresentationEvent};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rust_dense_mapping=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            PipelineConfig::load(&path).with_context(|| format!("loading {}", path))?
        }
        None => {
            info!("Using default configuration");
            PipelineConfig::default()
        }
    };

    let mut pipeline = PipelineManager::new(config)?;

    let (event_tx, event_rx) = crossbeam_channel::unbounded::<PresentationEvent>();
    pipeline.set_presentation_target(event_tx);
    let presenter = spawn_presenter(&pipeline, event_rx)?;

    pipeline.start()?;

    let sensor = SyntheticSensor::new(SyntheticSensorConfig::default());
    let num_frames = sensor.config().num_frames;
    info!("Streaming {} synthetic frames", num_frames);
    for frame in sensor {
        pipeline.submit_frame(frame)?;
    }

    pipeline.finish()?;
    pipeline.clear_presentation_target();

    // The presenter exits once its last sender is gone.
    let (live, updates) = presenter.join().unwrap_or_default();

    let stats = pipeline.stats();
    info!(
        "Done: frames={} tracked={} degraded={} keyframes={} fused={} rejected={} refinements={}/{}",
        stats.frames_received,
        stats.frames_tracked,
        stats.frames_degraded,
        stats.keyframes_emitted,
        stats.keyframes_fused,
        stats.keyframes_rejected,
        stats.optimizations_applied,
        stats.optimizations_applied + stats.optimizations_skipped
    );
    info!(
        "Map: {} surfels at voxel size {} (presentation saw {} live frames, {} map updates)",
        pipeline.voxel_map().len(),
        pipeline.config().voxel_size,
        live,
        updates
    );

    Ok(())
}

#[cfg(feature = "viz")]
fn spawn_presenter(
    pipeline: &PipelineManager,
    events: crossbeam_channel::Receiver<PresentationEvent>,
) -> Result<thread::JoinHandle<(u64, u64)>> {
    use rust_dense_mapping::viz::RerunPresenter;

    let presenter = RerunPresenter::spawn("rust-dense-mapping", pipeline.voxel_map())
        .context("spawning rerun viewer")?;
    let handle = thread::Builder::new()
        .name("presenter".into())
        .spawn(move || {
            presenter.run(events);
            (0, 0)
        })?;
    Ok(handle)
}

/// Without a viewer the events are only counted.
#[cfg(not(feature = "viz"))]
fn spawn_presenter(
    _pipeline: &PipelineManager,
    events: crossbeam_channel::Receiver<PresentationEvent>,
) -> Result<thread::JoinHandle<(u64, u64)>> {
    let handle = thread::Builder::new()
        .name("presenter".into())
        .spawn(move || {
            let mut live = 0;
            let mut updates = 0;
            for event in events {
                match event {
                    PresentationEvent::Live(_) => live += 1,
                    PresentationEvent::MapUpdated => updates += 1,
                }
            }
            (live, updates)
        })?;
    Ok(handle)
}
