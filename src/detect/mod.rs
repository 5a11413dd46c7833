//! Object detection: backends, the detector channel and post-processing.

mod backend;
mod backends;
pub mod channel;
pub mod consolidate;
mod labels;

pub use backend::{
    empty_detections, read_detections, write_detections, DetectorBackend, ModelDetector,
    ModelInput, ObjectDetector, RawDetections, DETECTION_FIELDS, MAX_DETECTIONS,
    RAW_DETECTIONS_BYTES,
};
pub use backends::{CpuBackend, StubBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use channel::{
    output_segment_name, release_connection, DetectionRequest, DetectorHub, DetectorProcess,
    DetectorStats, RegionDetection, RemoteDetector, DETECTION_TIMEOUT, RESPONSE_BYTES,
};
pub use consolidate::{reduce_detections, to_frame_detections, Detection};
pub use labels::LabelMap;
