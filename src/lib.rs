//! NVR capture-to-tracking pipeline.
//!
//! Per camera, a decoder subprocess feeds raw I420 frames into named shared
//! memory; a processing loop runs motion detection, picks square regions worth
//! sending to the object detector, and correlates detections into tracked
//! objects. Detectors run as supervised workers shared by all cameras.
//!
//! # Module Structure
//!
//! - `arena`: named shared-memory segments (frames, detector tensors)
//! - `capture`: decoder process, capture thread, capture watchdog
//! - `motion`: calibrating background-subtraction motion detector
//! - `region`: region clustering, sizing and the historical size grid
//! - `detect`: detector backends, request channel, post-processing
//! - `track`: greedy nearest-centroid object tracker
//! - `pipeline`: per-camera orchestration and pipeline output
//! - `config`: file + environment configuration and hot-reload deltas

use std::time::{SystemTime, UNIX_EPOCH};

pub mod arena;
pub mod capture;
pub mod config;
pub mod detect;
pub mod frame;
pub mod geometry;
pub mod metrics;
pub mod motion;
pub mod pipeline;
pub mod region;
pub mod sync;
pub mod track;

pub use arena::FrameArena;
pub use capture::{CaptureWatchdog, CaptureWorker, DecoderCommand};
pub use config::{CameraConfig, CameraConfigUpdate, NvrConfig};
pub use detect::{Detection, DetectorHub, DetectorProcess, LabelMap, RemoteDetector};
pub use frame::FrameShape;
pub use geometry::BoundingBox;
pub use metrics::{CameraHealthMetrics, EventsPerSecond, WatchdogState};
pub use motion::{MotionDetector, PtzMotorState};
pub use pipeline::{CameraPipeline, CameraPipelineProcess, PipelineContext, PipelineOutput};
pub use region::{DetectionRegion, RegionGridStore, RegionSelector, RegionSource};
pub use sync::Signal;
pub use track::{ObjectTracker, TrackedObject};

/// Wall-clock seconds since the Unix epoch.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
