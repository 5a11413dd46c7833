//! nvrd - camera pipeline daemon
//!
//! This daemon:
//! 1. Loads config (file named by --config / NVR_CONFIG, then env overrides)
//! 2. Starts the configured detector workers
//! 3. Starts one capture + processing pipeline per enabled camera
//! 4. Restarts detectors whose inference is stuck
//! 5. Consumes pipeline output: logs it, feeds the region grid, deletes frames

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nvr_pipeline::{
    CameraPipelineProcess, DetectorProcess, FrameArena, FrameShape, NvrConfig, PipelineContext,
    PipelineOutput, RegionGridStore, Signal,
};

const OUTPUT_QUEUE_DEPTH: usize = 64;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the camera capture-to-tracking pipeline")]
struct Args {
    /// Config file (TOML or JSON).
    #[arg(long, env = "NVR_CONFIG")]
    config: Option<PathBuf>,

    /// Print every pipeline output as a JSON line on stdout.
    #[arg(long)]
    json: bool,

    /// Seconds between health checks.
    #[arg(long, default_value_t = 10)]
    health_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = NvrConfig::load_from(args.config.as_deref())?;
    let grid_store = Arc::new(RegionGridStore::new());
    let ctx = PipelineContext::from_config(&config)?.with_grid_source(grid_store.clone());

    let mut detectors = Vec::new();
    for detector in config.detectors.values() {
        let mut process = DetectorProcess::new(detector.clone(), ctx.hub.clone());
        process.start_or_restart()?;
        detectors.push(process);
    }

    let (output_tx, output_rx) = bounded(OUTPUT_QUEUE_DEPTH);
    let mut cameras = Vec::new();
    for camera in config.enabled_cameras() {
        let shape = FrameShape::new(camera.detect.width, camera.detect.height);
        grid_store.register_camera(&camera.name, shape, config.model.min_region_size());
        let process = CameraPipelineProcess::start(camera.clone(), &ctx, output_tx.clone())
            .with_context(|| format!("start camera {}", camera.name))?;
        cameras.push(process);
    }
    drop(output_tx);
    if cameras.is_empty() {
        log::warn!("no enabled cameras configured");
    }

    let stop = Arc::new(Signal::new());
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.set()).context("error setting Ctrl-C handler")?;

    log::info!(
        "nvrd running: {} camera(s), {} detector(s)",
        cameras.len(),
        detectors.len()
    );

    let mut arena = FrameArena::new();
    let health_interval = Duration::from_secs(args.health_interval.max(1));
    let mut last_health = Instant::now();
    while !stop.is_set() {
        match output_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(output) => consume(&output, &grid_store, &mut arena, args.json),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_health.elapsed() >= health_interval {
            last_health = Instant::now();
            let now = nvr_pipeline::now_timestamp();
            for detector in detectors.iter_mut() {
                if !detector.is_running() {
                    log::error!("detector.{}: worker exited, restarting", detector.name());
                    if let Err(e) = detector.start_or_restart() {
                        log::error!("detector.{}: restart failed: {:#}", detector.name(), e);
                    }
                } else if detector.is_stuck(now, config.detector_stuck_timeout) {
                    log::warn!(
                        "detector.{}: inference stuck for more than {:?}, restarting",
                        detector.name(),
                        config.detector_stuck_timeout
                    );
                    if let Err(e) = detector.start_or_restart() {
                        log::error!("detector.{}: restart failed: {:#}", detector.name(), e);
                    }
                }
            }
            for camera in &cameras {
                let metrics = camera.metrics();
                log::info!(
                    "{}: state={:?} camera_fps={:.1} process_fps={:.1} detection_fps={:.1} skipped={} restarts={}",
                    camera.camera(),
                    metrics.state(),
                    metrics.camera_fps.load(),
                    metrics.process_fps.load(),
                    metrics.detection_fps.load(),
                    metrics.frames_skipped(),
                    metrics.restarts.load(Ordering::Acquire),
                );
            }
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    for camera in cameras.iter_mut() {
        camera.stop();
    }
    drain_outputs(&output_rx, &mut arena);
    for detector in detectors.iter_mut() {
        detector.stop();
    }
    log::info!("nvrd stopped");
    Ok(())
}

fn consume(output: &PipelineOutput, grid_store: &RegionGridStore, arena: &mut FrameArena, json: bool) {
    for object in output.objects.values() {
        if !object.false_positive && object.disappeared == 0 {
            grid_store.observe(&output.camera, &object.bbox);
        }
    }
    if json {
        match serde_json::to_string(output) {
            Ok(line) => println!("{}", line),
            Err(e) => log::warn!("{}: cannot encode output: {}", output.camera, e),
        }
    } else if !output.objects.is_empty() {
        log::debug!(
            "{}: {} object(s), {} motion box(es), {} region(s) at {}",
            output.camera,
            output.objects.len(),
            output.motion_boxes.len(),
            output.regions.len(),
            output.frame_time
        );
    }
    if let Err(e) = arena.delete(&output.frame_name) {
        log::warn!("{}: {:#}", output.camera, e);
    }
}

fn drain_outputs(outputs: &Receiver<PipelineOutput>, arena: &mut FrameArena) {
    for output in outputs.try_iter() {
        let _ = arena.delete(&output.frame_name);
    }
}
