//! Per-camera pipeline: motion -> regions -> detector -> tracker.
//!
//! `CameraPipelineProcess` owns two threads per camera:
//!
//! - the capture watchdog, which runs the decoder and the capture thread and
//!   restarts them when they stall
//! - the processing loop, which pulls frame times from the bounded frame
//!   queue, analyses the frame and pushes a `PipelineOutput` to the consumer
//!
//! The consumer owns every frame named in an output and deletes it when done.
//! Frames that never reach the consumer are deleted here.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::arena::FrameArena;
use crate::capture::{CaptureWatchdog, DecoderCommand, WatchdogTimings, FRAME_QUEUE_DEPTH};
use crate::config::{CameraConfig, CameraConfigUpdate, ModelConfig, NvrConfig};
use crate::detect::{
    reduce_detections, release_connection, to_frame_detections, Detection, DetectorHub, LabelMap,
    RemoteDetector,
};
use crate::frame::{create_tensor_input, frame_name, luma_plane, FrameShape};
use crate::geometry::{intersects_any, BoundingBox};
use crate::metrics::{CameraHealthMetrics, EventsPerSecond};
use crate::motion::{MotionDetector, PtzMotorState};
use crate::region::{DetectionRegion, RegionGridSource, RegionSelector};
use crate::sync::Signal;
use crate::track::{ObjectTracker, TrackedObject};

/// Stationary objects are re-detected whenever their motionless count is a
/// multiple of this.
pub const STATIONARY_RECHECK_INTERVAL: u32 = 50;
pub const UPDATE_QUEUE_DEPTH: usize = 16;
const FRAME_POLL: Duration = Duration::from_secs(1);

/// One processed frame, as seen by downstream consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub camera: String,
    pub frame_name: String,
    pub frame_time: f64,
    pub objects: BTreeMap<String, TrackedObject>,
    pub motion_boxes: Vec<BoundingBox>,
    pub regions: Vec<DetectionRegion>,
}

/// Process-wide collaborators handed to every camera.
pub struct PipelineContext {
    pub model: ModelConfig,
    pub labels: Arc<LabelMap>,
    pub hub: Arc<DetectorHub>,
    pub grid_source: Option<Arc<dyn RegionGridSource>>,
    pub shm_frame_count: usize,
    pub region_grid_refresh: Duration,
}

impl PipelineContext {
    pub fn new(model: ModelConfig, labels: LabelMap) -> Self {
        Self {
            hub: Arc::new(DetectorHub::new(model.clone())),
            model,
            labels: Arc::new(labels),
            grid_source: None,
            shm_frame_count: crate::frame::DEFAULT_SHM_FRAME_COUNT,
            region_grid_refresh: Duration::from_secs(3600),
        }
    }

    /// Build from config, loading the label map if one is configured.
    pub fn from_config(config: &NvrConfig) -> Result<Self> {
        let labels = match &config.model.labelmap_path {
            Some(path) => LabelMap::load(path)?,
            None => LabelMap::coco(),
        };
        let mut ctx = Self::new(config.model.clone(), labels);
        ctx.shm_frame_count = config.shm_frame_count;
        ctx.region_grid_refresh = config.region_grid_refresh;
        Ok(ctx)
    }

    pub fn with_grid_source(mut self, source: Arc<dyn RegionGridSource>) -> Self {
        self.grid_source = Some(source);
        self
    }
}

// ----------------------------------------------------------------------------
// Frame processing
// ----------------------------------------------------------------------------

/// Objects that sat still long enough, are currently visible and do not touch
/// any motion box. They are carried over instead of re-detected.
pub fn stationary_object_ids(
    tracker: &ObjectTracker,
    threshold: u32,
    motion_boxes: &[BoundingBox],
) -> HashSet<String> {
    tracker
        .tracked_objects()
        .values()
        .filter(|o| o.motionless_count >= threshold)
        .filter(|o| o.motionless_count % STATIONARY_RECHECK_INTERVAL != 0)
        .filter(|o| o.disappeared == 0)
        .filter(|o| !intersects_any(&o.bbox, motion_boxes))
        .map(|o| o.id.clone())
        .collect()
}

/// Boxes the region selector must cover: moving objects at their estimated
/// position, resting objects at their box, plus untracked candidates.
pub fn object_boxes(
    tracker: &ObjectTracker,
    stationary: &HashSet<String>,
    threshold: u32,
) -> Vec<BoundingBox> {
    tracker
        .tracked_objects()
        .values()
        .filter(|o| !stationary.contains(&o.id))
        .map(|o| {
            if o.motionless_count < threshold {
                o.estimate
            } else {
                o.bbox
            }
        })
        .chain(tracker.untracked_object_boxes().iter().copied())
        .collect()
}

pub struct CameraPipeline {
    camera: CameraConfig,
    shape: FrameShape,
    model: ModelConfig,
    detectable: Vec<String>,
    arena: FrameArena,
    motion: MotionDetector,
    selector: RegionSelector,
    detector: RemoteDetector,
    tracker: ObjectTracker,
    ptz: Arc<PtzMotorState>,
    metrics: Arc<CameraHealthMetrics>,
    detect_fps: Option<Arc<AtomicU32>>,
    grid_source: Option<Arc<dyn RegionGridSource>>,
    grid_refresh: Duration,
    last_grid_refresh: Option<Instant>,
    process_fps: EventsPerSecond,
    enabled: bool,
    announce_disabled: bool,
}

impl CameraPipeline {
    pub fn new(
        camera: CameraConfig,
        ctx: &PipelineContext,
        metrics: Arc<CameraHealthMetrics>,
        ptz: Arc<PtzMotorState>,
    ) -> Result<Self> {
        let shape = FrameShape::new(camera.detect.width, camera.detect.height);
        let motion = MotionDetector::new(shape, camera.motion.clone(), ptz.clone())
            .with_context(|| format!("{}: motion detector", camera.name))?;
        let detector = RemoteDetector::connect(&camera.name, ctx.hub.clone(), ctx.labels.clone())?;
        let tracker = ObjectTracker::new(camera.detect.clone(), camera.objects.clone());
        let mut process_fps = EventsPerSecond::default();
        process_fps.start();
        Ok(Self {
            detectable: camera.detectable_labels(),
            selector: RegionSelector::new(shape, ctx.model.min_region_size()),
            model: ctx.model.clone(),
            arena: FrameArena::new(),
            motion,
            detector,
            tracker,
            ptz,
            metrics,
            detect_fps: None,
            grid_source: ctx.grid_source.clone(),
            grid_refresh: ctx.region_grid_refresh,
            last_grid_refresh: None,
            process_fps,
            enabled: camera.enabled,
            announce_disabled: false,
            shape,
            camera,
        })
    }

    /// Share the fps the capture watchdog checks the decoder against.
    pub fn with_detect_fps(mut self, detect_fps: Arc<AtomicU32>) -> Self {
        self.detect_fps = Some(detect_fps);
        self
    }

    pub fn camera(&self) -> &CameraConfig {
        &self.camera
    }

    pub fn tracker(&self) -> &ObjectTracker {
        &self.tracker
    }

    pub fn motion(&self) -> &MotionDetector {
        &self.motion
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Apply a config delta between frames.
    pub fn apply_update(&mut self, update: CameraConfigUpdate) {
        match update {
            CameraConfigUpdate::Detect {
                fps,
                enabled,
                max_disappeared,
                stationary_threshold,
            } => {
                let detect = &mut self.camera.detect;
                detect.fps = fps;
                detect.enabled = enabled;
                detect.max_disappeared = max_disappeared;
                detect.stationary.threshold = stationary_threshold;
                self.tracker.update_settings(detect.clone());
                if let Some(handle) = &self.detect_fps {
                    handle.store(fps, Ordering::Release);
                }
                log::info!("{}: detect config updated (fps {}, enabled {})", self.camera.name, fps, enabled);
            }
            CameraConfigUpdate::Motion(settings) => {
                if let Err(e) = self.motion.update_settings(settings.clone()) {
                    log::error!("{}: rejected motion config: {:#}", self.camera.name, e);
                    return;
                }
                self.camera.motion = settings;
                log::info!("{}: motion config updated", self.camera.name);
            }
            CameraConfigUpdate::Enabled(enabled) => {
                if enabled == self.enabled {
                    return;
                }
                self.enabled = enabled;
                if enabled {
                    self.selector.request_startup_scan();
                    log::info!("{}: enabled", self.camera.name);
                } else {
                    let ended = self.tracker.end_all();
                    self.announce_disabled = true;
                    log::info!("{}: disabled, ended {} tracked objects", self.camera.name, ended.len());
                }
            }
        }
    }

    /// Analyse one frame. Returns `None` when the frame was dropped (missing
    /// or camera disabled); in that case nothing refers to the frame any more.
    pub fn process_frame(&mut self, frame_time: f64) -> Option<PipelineOutput> {
        let name = frame_name(&self.camera.name, frame_time);
        if !self.enabled {
            if std::mem::take(&mut self.announce_disabled) {
                return Some(self.output(name, frame_time, Vec::new(), Vec::new()));
            }
            self.delete_frame(&name);
            return None;
        }
        self.refresh_grid();

        let Some(frame) = self.arena.get(&name, self.shape.yuv_size()) else {
            log::warn!("{}: frame {} is not in shared memory, skipping", self.camera.name, name);
            return None;
        };

        let motion_boxes = match luma_plane(frame, &self.shape) {
            Ok(luma) => self.motion.detect(luma),
            Err(e) => {
                log::warn!("{}: {:#}", self.camera.name, e);
                Vec::new()
            }
        };
        let calibrating = self.motion.is_calibrating();
        let threshold = self.camera.detect.stationary.threshold;
        let live_motion: &[BoundingBox] = if calibrating { &[] } else { &motion_boxes };
        let stationary = stationary_object_ids(&self.tracker, threshold, live_motion);

        let mut regions = Vec::new();
        let mut detections: Vec<Detection> = Vec::new();
        if self.camera.detect.enabled {
            let boxes = object_boxes(&self.tracker, &stationary, threshold);
            let include_motion = !calibrating && !self.ptz.is_moving();
            regions = self.selector.select(&boxes, &motion_boxes, include_motion);

            detections.extend(
                self.tracker
                    .tracked_objects()
                    .values()
                    .filter(|o| stationary.contains(&o.id))
                    .map(|o| Detection::new(&o.label, o.score, o.bbox, o.region)),
            );
            for region in &regions {
                let tensor = match create_tensor_input(
                    frame,
                    &self.shape,
                    &region.bounds,
                    self.model.width,
                    self.model.height,
                ) {
                    Ok(tensor) => tensor,
                    Err(e) => {
                        log::warn!("{}: region {:?}: {:#}", self.camera.name, region.bounds, e);
                        continue;
                    }
                };
                let rows = self.detector.detect(&tensor);
                detections.extend(to_frame_detections(
                    &rows,
                    &region.bounds,
                    self.shape,
                    &self.camera.objects,
                    &self.detectable,
                ));
            }
        }
        self.arena.close(&name);

        if !self.camera.detect.enabled {
            if !self.tracker.is_empty() {
                self.tracker.end_all();
            }
        } else if regions.is_empty() {
            self.tracker.update_frame_times(frame_time);
        } else {
            let consolidated = reduce_detections(self.shape, detections);
            let (attributes, tracked): (Vec<Detection>, Vec<Detection>) = consolidated
                .into_iter()
                .partition(|d| self.camera.is_attribute(&d.label));
            self.tracker.match_and_update(frame_time, tracked);
            self.tracker
                .set_untracked_object_boxes(attributes.iter().map(|d| d.bbox).collect());
            self.tracker.attach_attributes(&attributes);
        }
        self.tracker.set_stationary(&stationary);

        self.process_fps.update();
        self.metrics.process_fps.store(self.process_fps.eps());
        self.metrics.detection_fps.store(self.detector.fps());

        Some(self.output(name, frame_time, motion_boxes, regions))
    }

    fn output(
        &self,
        frame_name: String,
        frame_time: f64,
        motion_boxes: Vec<BoundingBox>,
        regions: Vec<DetectionRegion>,
    ) -> PipelineOutput {
        PipelineOutput {
            camera: self.camera.name.clone(),
            frame_name,
            frame_time,
            objects: self.tracker.tracked_objects().clone(),
            motion_boxes,
            regions,
        }
    }

    fn refresh_grid(&mut self) {
        let Some(source) = &self.grid_source else {
            return;
        };
        let due = self
            .last_grid_refresh
            .map_or(true, |at| at.elapsed() >= self.grid_refresh);
        if !due {
            return;
        }
        self.last_grid_refresh = Some(Instant::now());
        match source.region_grid(&self.camera.name) {
            Some(grid) => {
                self.selector.set_grid(grid);
                log::debug!("{}: region grid refreshed", self.camera.name);
            }
            None => log::debug!("{}: no region grid yet, keeping previous", self.camera.name),
        }
    }

    fn delete_frame(&mut self, name: &str) {
        if let Err(e) = self.arena.delete(name) {
            log::warn!("{}: {:#}", self.camera.name, e);
        }
    }

    /// Process frames until `stop` is raised or the frame queue closes, then
    /// delete whatever is still queued.
    pub fn run(
        mut self,
        frames: Receiver<f64>,
        updates: Receiver<CameraConfigUpdate>,
        output: Sender<PipelineOutput>,
        stop: Arc<Signal>,
    ) {
        log::info!("{}: processing frames", self.camera.name);
        while !stop.is_set() {
            for update in updates.try_iter() {
                self.apply_update(update);
            }
            let frame_time = match frames.recv_timeout(FRAME_POLL) {
                Ok(frame_time) => frame_time,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            let Some(out) = self.process_frame(frame_time) else {
                continue;
            };
            match output.try_send(out) {
                Ok(()) => {}
                Err(TrySendError::Full(out)) => {
                    log::debug!("{}: output queue full, dropping {}", self.camera.name, out.frame_name);
                    self.delete_frame(&out.frame_name);
                }
                Err(TrySendError::Disconnected(out)) => {
                    self.delete_frame(&out.frame_name);
                    break;
                }
            }
        }
        for frame_time in frames.try_iter() {
            self.delete_frame(&frame_name(&self.camera.name, frame_time));
        }
        self.detector.close();
        log::info!("{}: exiting frame processing", self.camera.name);
    }
}

// ----------------------------------------------------------------------------
// Camera process
// ----------------------------------------------------------------------------

/// Capture watchdog plus processing loop for one camera.
pub struct CameraPipelineProcess {
    camera: String,
    metrics: Arc<CameraHealthMetrics>,
    ptz: Arc<PtzMotorState>,
    updates: Sender<CameraConfigUpdate>,
    frames: Receiver<f64>,
    stop: Arc<Signal>,
    watchdog: Option<JoinHandle<Result<()>>>,
    pipeline: Option<JoinHandle<()>>,
}

impl CameraPipelineProcess {
    pub fn start(
        camera: CameraConfig,
        ctx: &PipelineContext,
        output: Sender<PipelineOutput>,
    ) -> Result<Self> {
        let command = DecoderCommand::ffmpeg(&camera.ffmpeg, &camera.detect);
        Self::start_with_command(camera, command, ctx, output)
    }

    /// Start with an explicit decoder command (anything writing raw I420
    /// frames of the detect size to stdout).
    pub fn start_with_command(
        camera: CameraConfig,
        command: DecoderCommand,
        ctx: &PipelineContext,
        output: Sender<PipelineOutput>,
    ) -> Result<Self> {
        let name = camera.name.clone();
        let shape = FrameShape::new(camera.detect.width, camera.detect.height);
        let metrics = Arc::new(CameraHealthMetrics::new());
        let ptz = Arc::new(PtzMotorState::new());
        let stop = Arc::new(Signal::new());
        let (frame_tx, frame_rx) = bounded(FRAME_QUEUE_DEPTH);
        let (update_tx, update_rx) = bounded(UPDATE_QUEUE_DEPTH);

        let watchdog = CaptureWatchdog::new(
            &name,
            command,
            shape,
            WatchdogTimings::from(&camera.ffmpeg),
            camera.detect.fps,
            ctx.shm_frame_count,
            frame_tx,
            metrics.clone(),
            stop.clone(),
        );
        let pipeline = CameraPipeline::new(camera, ctx, metrics.clone(), ptz.clone())?
            .with_detect_fps(watchdog.detect_fps_handle());

        let pipeline_frames = frame_rx.clone();
        let pipeline_stop = stop.clone();
        let pipeline_handle = thread::Builder::new()
            .name(format!("process:{}", name))
            .spawn(move || pipeline.run(pipeline_frames, update_rx, output, pipeline_stop))
            .with_context(|| format!("{}: spawn processing thread", name))?;
        let watchdog_handle = thread::Builder::new()
            .name(format!("watchdog:{}", name))
            .spawn(move || watchdog.run())
            .with_context(|| format!("{}: spawn watchdog thread", name))?;

        log::info!("{}: camera pipeline started", name);
        Ok(Self {
            camera: name,
            metrics,
            ptz,
            updates: update_tx,
            frames: frame_rx,
            stop,
            watchdog: Some(watchdog_handle),
            pipeline: Some(pipeline_handle),
        })
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn metrics(&self) -> Arc<CameraHealthMetrics> {
        self.metrics.clone()
    }

    pub fn ptz(&self) -> Arc<PtzMotorState> {
        self.ptz.clone()
    }

    /// Queue a config delta for the processing loop.
    pub fn update_config(&self, update: CameraConfigUpdate) -> Result<()> {
        self.updates
            .try_send(update)
            .map_err(|e| anyhow!("{}: config update not delivered: {}", self.camera, e))
    }

    /// Stop both threads, then delete frames still queued and the detector
    /// buffers of this camera.
    pub fn stop(&mut self) {
        self.stop.set();
        if let Some(handle) = self.pipeline.take() {
            if handle.join().is_err() {
                log::error!("{}: processing thread panicked", self.camera);
            }
        }
        if let Some(handle) = self.watchdog.take() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::error!("{}: capture failed: {:#}", self.camera, e),
                Err(_) => log::error!("{}: watchdog thread panicked", self.camera),
            }
        }
        let mut arena = FrameArena::new();
        for frame_time in self.frames.try_iter() {
            let _ = arena.delete(&frame_name(&self.camera, frame_time));
        }
        if let Err(e) = release_connection(&self.camera) {
            log::warn!("{}: {:#}", self.camera, e);
        }
        log::info!("{}: camera pipeline stopped", self.camera);
    }
}

impl Drop for CameraPipelineProcess {
    fn drop(&mut self) {
        if self.pipeline.is_some() || self.watchdog.is_some() {
            self.stop();
        }
    }
}
