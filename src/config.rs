use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::frame::DEFAULT_SHM_FRAME_COUNT;

const DEFAULT_FFMPEG_PROGRAM: &str = "ffmpeg";
const DEFAULT_INPUT_ARGS: &[&str] = &[
    "-avoid_negative_ts",
    "make_zero",
    "-fflags",
    "+genpts+discardcorrupt",
    "-rtsp_transport",
    "tcp",
    "-timeout",
    "5000000",
    "-use_wallclock_as_timestamps",
    "1",
];
const DEFAULT_RETRY_INTERVAL_SECS: f64 = 10.0;
const DEFAULT_STALL_TIMEOUT_SECS: f64 = 20.0;
const DEFAULT_TERMINATE_TIMEOUT_SECS: f64 = 30.0;

const DEFAULT_DETECT_WIDTH: u32 = 1280;
const DEFAULT_DETECT_HEIGHT: u32 = 720;
const DEFAULT_DETECT_FPS: u32 = 5;

const DEFAULT_MOTION_THRESHOLD: u8 = 30;
const DEFAULT_LIGHTNING_THRESHOLD: f64 = 0.8;
const DEFAULT_CONTOUR_AREA: u32 = 10;
const DEFAULT_FRAME_ALPHA: f64 = 0.01;
const DEFAULT_MOTION_FRAME_HEIGHT: u32 = 100;

const DEFAULT_MIN_SCORE: f32 = 0.5;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.7;
const DEFAULT_MAX_AREA: i64 = 24_000_000;
const DEFAULT_MAX_RATIO: f64 = 24_000_000.0;
const DEFAULT_TRACKED_LABEL: &str = "person";

const DEFAULT_MODEL_SIZE: u32 = 320;
const DEFAULT_DETECTOR_NAME: &str = "cpu";
const DEFAULT_DETECTOR_STUCK_SECS: f64 = 10.0;
const DEFAULT_REGION_GRID_REFRESH_SECS: u64 = 60 * 60;

const CAMERA_NAME_PATTERN: &str = r"^[A-Za-z0-9_-]+$";

// ----------------------------------------------------------------------------
// File layer (every field optional)
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct NvrConfigFile {
    shm_frame_count: Option<usize>,
    model: Option<ModelConfigFile>,
    detectors: Option<BTreeMap<String, DetectorConfigFile>>,
    detector_stuck_timeout: Option<f64>,
    region_grid_refresh: Option<u64>,
    cameras: Option<BTreeMap<String, CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    input_tensor: Option<InputTensor>,
    labelmap_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    #[serde(rename = "type")]
    kind: Option<String>,
    model_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    enabled: Option<bool>,
    ffmpeg: Option<FfmpegConfigFile>,
    detect: Option<DetectConfigFile>,
    motion: Option<MotionConfigFile>,
    objects: Option<ObjectsConfigFile>,
    attributes: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct FfmpegConfigFile {
    program: Option<String>,
    path: Option<String>,
    input_args: Option<Vec<String>>,
    retry_interval: Option<f64>,
    stall_timeout: Option<f64>,
    terminate_timeout: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    enabled: Option<bool>,
    max_disappeared: Option<u32>,
    stationary: Option<StationaryConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StationaryConfigFile {
    threshold: Option<u32>,
    max_frames: Option<StationaryMaxFramesFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StationaryMaxFramesFile {
    default: Option<u32>,
    objects: Option<HashMap<String, u32>>,
}

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    enabled: Option<bool>,
    threshold: Option<u8>,
    lightning_threshold: Option<f64>,
    improve_contrast: Option<bool>,
    contour_area: Option<u32>,
    frame_alpha: Option<f64>,
    frame_height: Option<u32>,
    mask: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct ObjectsConfigFile {
    track: Option<Vec<String>>,
    filters: Option<HashMap<String, ObjectFilterFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct ObjectFilterFile {
    min_area: Option<i64>,
    max_area: Option<i64>,
    min_ratio: Option<f64>,
    max_ratio: Option<f64>,
    min_score: Option<f32>,
    threshold: Option<f32>,
}

// ----------------------------------------------------------------------------
// Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NvrConfig {
    /// Frames each camera may keep alive in shared memory.
    pub shm_frame_count: usize,
    pub model: ModelConfig,
    pub detectors: BTreeMap<String, DetectorConfig>,
    pub detector_stuck_timeout: Duration,
    pub region_grid_refresh: Duration,
    pub cameras: BTreeMap<String, CameraConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputTensor {
    Nhwc,
    Nchw,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub width: u32,
    pub height: u32,
    pub input_tensor: InputTensor,
    pub labelmap_path: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_MODEL_SIZE,
            height: DEFAULT_MODEL_SIZE,
            input_tensor: InputTensor::Nhwc,
            labelmap_path: None,
        }
    }
}

impl ModelConfig {
    /// Smallest region worth sending to this model: half its larger side,
    /// rounded up to a multiple of 4.
    pub fn min_region_size(&self) -> i32 {
        let half = (self.width.max(self.height) / 2) as i32;
        (half + 3) / 4 * 4
    }

    /// Bytes of one HWC RGB input tensor.
    pub fn tensor_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Cpu,
    Stub,
    Tract,
}

impl DetectorKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "stub" => Ok(Self::Stub),
            "tract" => Ok(Self::Tract),
            other => Err(anyhow!(
                "unsupported detector type {:?} (expected cpu, stub or tract)",
                other
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Stub => "stub",
            Self::Tract => "tract",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub name: String,
    pub kind: DetectorKind,
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub name: String,
    pub enabled: bool,
    pub ffmpeg: FfmpegSettings,
    pub detect: DetectSettings,
    pub motion: MotionSettings,
    pub objects: ObjectSettings,
    /// Labels the model reports that are attached to tracked objects rather
    /// than tracked themselves (faces, plates, logos).
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub program: String,
    pub path: String,
    pub input_args: Vec<String>,
    pub retry_interval: Duration,
    pub stall_timeout: Duration,
    pub terminate_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub enabled: bool,
    pub max_disappeared: u32,
    pub stationary: StationarySettings,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationarySettings {
    /// Frames without movement before an object counts as stationary.
    pub threshold: u32,
    pub max_frames_default: Option<u32>,
    pub max_frames_objects: HashMap<String, u32>,
}

impl StationarySettings {
    /// Frames a stationary object of `label` may stay tracked, if limited.
    pub fn max_frames_for(&self, label: &str) -> Option<u32> {
        self.max_frames_objects
            .get(label)
            .copied()
            .or(self.max_frames_default)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MotionSettings {
    pub enabled: bool,
    pub threshold: u8,
    pub lightning_threshold: f64,
    pub improve_contrast: bool,
    pub contour_area: u32,
    pub frame_alpha: f64,
    pub frame_height: u32,
    /// Exclusion polygons, each `"x1,y1,x2,y2,..."` at detect resolution.
    pub mask: Vec<String>,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: DEFAULT_MOTION_THRESHOLD,
            lightning_threshold: DEFAULT_LIGHTNING_THRESHOLD,
            improve_contrast: true,
            contour_area: DEFAULT_CONTOUR_AREA,
            frame_alpha: DEFAULT_FRAME_ALPHA,
            frame_height: DEFAULT_MOTION_FRAME_HEIGHT,
            mask: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectFilter {
    pub min_area: i64,
    pub max_area: i64,
    pub min_ratio: f64,
    pub max_ratio: f64,
    pub min_score: f32,
    /// Median score a tracked object needs to count as a true positive.
    pub threshold: f32,
}

impl Default for ObjectFilter {
    fn default() -> Self {
        Self {
            min_area: 0,
            max_area: DEFAULT_MAX_AREA,
            min_ratio: 0.0,
            max_ratio: DEFAULT_MAX_RATIO,
            min_score: DEFAULT_MIN_SCORE,
            threshold: DEFAULT_SCORE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSettings {
    pub track: Vec<String>,
    pub filters: HashMap<String, ObjectFilter>,
}

impl Default for ObjectSettings {
    fn default() -> Self {
        Self {
            track: vec![DEFAULT_TRACKED_LABEL.to_string()],
            filters: HashMap::new(),
        }
    }
}

impl ObjectSettings {
    pub fn filter_for(&self, label: &str) -> ObjectFilter {
        self.filters.get(label).cloned().unwrap_or_default()
    }

    pub fn is_tracked(&self, label: &str) -> bool {
        self.track.iter().any(|t| t == label)
    }
}

/// Camera-scoped config delta delivered while the pipeline runs.
#[derive(Debug, Clone, PartialEq)]
pub enum CameraConfigUpdate {
    Detect {
        fps: u32,
        enabled: bool,
        max_disappeared: u32,
        stationary_threshold: u32,
    },
    Motion(MotionSettings),
    Enabled(bool),
}

// ----------------------------------------------------------------------------
// Loading
// ----------------------------------------------------------------------------

impl NvrConfig {
    /// Load from the file named by `NVR_CONFIG` (defaults when unset).
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("NVR_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: NvrConfigFile) -> Result<Self> {
        let model_file = file.model.unwrap_or_default();
        let model = ModelConfig {
            width: model_file.width.unwrap_or(DEFAULT_MODEL_SIZE),
            height: model_file.height.unwrap_or(DEFAULT_MODEL_SIZE),
            input_tensor: model_file.input_tensor.unwrap_or(InputTensor::Nhwc),
            labelmap_path: model_file.labelmap_path,
        };

        let mut detectors = BTreeMap::new();
        for (name, detector) in file.detectors.unwrap_or_default() {
            let kind = DetectorKind::parse(detector.kind.as_deref().unwrap_or(DEFAULT_DETECTOR_NAME))
                .with_context(|| format!("detector {}", name))?;
            detectors.insert(
                name.clone(),
                DetectorConfig {
                    name,
                    kind,
                    model_path: detector.model_path,
                },
            );
        }
        if detectors.is_empty() {
            detectors.insert(
                DEFAULT_DETECTOR_NAME.to_string(),
                DetectorConfig {
                    name: DEFAULT_DETECTOR_NAME.to_string(),
                    kind: DetectorKind::Cpu,
                    model_path: None,
                },
            );
        }

        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|(name, camera)| {
                let camera = camera_from_file(&name, camera);
                (name, camera)
            })
            .collect();

        Ok(Self {
            shm_frame_count: file.shm_frame_count.unwrap_or(DEFAULT_SHM_FRAME_COUNT),
            model,
            detectors,
            detector_stuck_timeout: Duration::from_secs_f64(
                file.detector_stuck_timeout
                    .unwrap_or(DEFAULT_DETECTOR_STUCK_SECS)
                    .max(0.0),
            ),
            region_grid_refresh: Duration::from_secs(
                file.region_grid_refresh
                    .unwrap_or(DEFAULT_REGION_GRID_REFRESH_SECS),
            ),
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(count) = std::env::var("NVR_SHM_FRAME_COUNT") {
            self.shm_frame_count = count
                .trim()
                .parse()
                .map_err(|_| anyhow!("NVR_SHM_FRAME_COUNT must be a positive integer"))?;
        }
        if let Ok(kind) = std::env::var("NVR_DETECTOR_TYPE") {
            if !kind.trim().is_empty() {
                let kind = DetectorKind::parse(&kind).context("NVR_DETECTOR_TYPE")?;
                for detector in self.detectors.values_mut() {
                    detector.kind = kind;
                }
            }
        }
        if let Ok(path) = std::env::var("NVR_MODEL_PATH") {
            if !path.trim().is_empty() {
                for detector in self.detectors.values_mut() {
                    detector.model_path = Some(PathBuf::from(&path));
                }
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.shm_frame_count == 0 {
            return Err(anyhow!("shm_frame_count must be greater than zero"));
        }
        if self.model.width == 0 || self.model.height == 0 {
            return Err(anyhow!("model width and height must be greater than zero"));
        }
        if self.detector_stuck_timeout.is_zero() {
            return Err(anyhow!("detector_stuck_timeout must be greater than zero"));
        }
        let name_pattern = Regex::new(CAMERA_NAME_PATTERN)?;
        for camera in self.cameras.values() {
            if !name_pattern.is_match(&camera.name) {
                return Err(anyhow!(
                    "camera name {:?} may only contain letters, digits, '_' and '-'",
                    camera.name
                ));
            }
            camera
                .validate()
                .with_context(|| format!("camera {}", camera.name))?;
        }
        Ok(())
    }

    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.values().filter(|camera| camera.enabled)
    }
}

impl CameraConfig {
    /// Camera with default settings and the given detect resolution.
    pub fn new(name: &str, width: u32, height: u32, fps: u32) -> Self {
        let detect = DetectConfigFile {
            width: Some(width),
            height: Some(height),
            fps: Some(fps),
            ..Default::default()
        };
        camera_from_file(
            name,
            CameraConfigFile {
                detect: Some(detect),
                ..Default::default()
            },
        )
    }

    /// Labels that survive detection filtering: tracked labels plus attributes.
    pub fn detectable_labels(&self) -> Vec<String> {
        let mut labels = self.objects.track.clone();
        for attribute in &self.attributes {
            if !labels.contains(attribute) {
                labels.push(attribute.clone());
            }
        }
        labels
    }

    pub fn is_attribute(&self, label: &str) -> bool {
        self.attributes.iter().any(|a| a == label)
    }

    fn validate(&self) -> Result<()> {
        let detect = &self.detect;
        if detect.width == 0 || detect.height == 0 {
            return Err(anyhow!("detect width and height must be greater than zero"));
        }
        if detect.width % 2 != 0 || detect.height % 2 != 0 {
            return Err(anyhow!(
                "detect resolution {}x{} must be even for YUV 4:2:0 frames",
                detect.width,
                detect.height
            ));
        }
        if detect.fps == 0 {
            return Err(anyhow!("detect fps must be greater than zero"));
        }
        let motion = &self.motion;
        if motion.frame_height == 0 {
            return Err(anyhow!("motion frame_height must be greater than zero"));
        }
        if !(motion.frame_alpha > 0.0 && motion.frame_alpha <= 1.0) {
            return Err(anyhow!("motion frame_alpha must be in (0, 1]"));
        }
        if !(motion.lightning_threshold > 0.0 && motion.lightning_threshold <= 1.0) {
            return Err(anyhow!("motion lightning_threshold must be in (0, 1]"));
        }
        for (label, filter) in &self.objects.filters {
            if filter.min_area > filter.max_area || filter.min_ratio > filter.max_ratio {
                return Err(anyhow!("object filter for {} has min above max", label));
            }
        }
        if self.ffmpeg.retry_interval.is_zero() {
            return Err(anyhow!("ffmpeg retry_interval must be greater than zero"));
        }
        Ok(())
    }
}

fn camera_from_file(name: &str, file: CameraConfigFile) -> CameraConfig {
    let ffmpeg_file = file.ffmpeg.unwrap_or_default();
    let ffmpeg = FfmpegSettings {
        program: ffmpeg_file
            .program
            .unwrap_or_else(|| DEFAULT_FFMPEG_PROGRAM.to_string()),
        path: ffmpeg_file.path.unwrap_or_default(),
        input_args: ffmpeg_file
            .input_args
            .unwrap_or_else(|| DEFAULT_INPUT_ARGS.iter().map(|a| a.to_string()).collect()),
        retry_interval: secs(ffmpeg_file.retry_interval, DEFAULT_RETRY_INTERVAL_SECS),
        stall_timeout: secs(ffmpeg_file.stall_timeout, DEFAULT_STALL_TIMEOUT_SECS),
        terminate_timeout: secs(ffmpeg_file.terminate_timeout, DEFAULT_TERMINATE_TIMEOUT_SECS),
    };

    let detect_file = file.detect.unwrap_or_default();
    let fps = detect_file.fps.unwrap_or(DEFAULT_DETECT_FPS);
    let stationary_file = detect_file.stationary.unwrap_or_default();
    let max_frames = stationary_file.max_frames.unwrap_or_default();
    let detect = DetectSettings {
        width: detect_file.width.unwrap_or(DEFAULT_DETECT_WIDTH),
        height: detect_file.height.unwrap_or(DEFAULT_DETECT_HEIGHT),
        fps,
        enabled: detect_file.enabled.unwrap_or(true),
        max_disappeared: detect_file.max_disappeared.unwrap_or(fps * 5),
        stationary: StationarySettings {
            threshold: stationary_file.threshold.unwrap_or(fps * 10),
            max_frames_default: max_frames.default,
            max_frames_objects: max_frames.objects.unwrap_or_default(),
        },
    };

    let motion_file = file.motion.unwrap_or_default();
    let defaults = MotionSettings::default();
    let motion = MotionSettings {
        enabled: motion_file.enabled.unwrap_or(defaults.enabled),
        threshold: motion_file.threshold.unwrap_or(defaults.threshold),
        lightning_threshold: motion_file
            .lightning_threshold
            .unwrap_or(defaults.lightning_threshold),
        improve_contrast: motion_file
            .improve_contrast
            .unwrap_or(defaults.improve_contrast),
        contour_area: motion_file.contour_area.unwrap_or(defaults.contour_area),
        frame_alpha: motion_file.frame_alpha.unwrap_or(defaults.frame_alpha),
        frame_height: motion_file.frame_height.unwrap_or(defaults.frame_height),
        mask: motion_file.mask.unwrap_or_default(),
    };

    let objects_file = file.objects.unwrap_or_default();
    let objects = ObjectSettings {
        track: objects_file
            .track
            .unwrap_or_else(|| vec![DEFAULT_TRACKED_LABEL.to_string()]),
        filters: objects_file
            .filters
            .unwrap_or_default()
            .into_iter()
            .map(|(label, f)| {
                let base = ObjectFilter::default();
                let filter = ObjectFilter {
                    min_area: f.min_area.unwrap_or(base.min_area),
                    max_area: f.max_area.unwrap_or(base.max_area),
                    min_ratio: f.min_ratio.unwrap_or(base.min_ratio),
                    max_ratio: f.max_ratio.unwrap_or(base.max_ratio),
                    min_score: f.min_score.unwrap_or(base.min_score),
                    threshold: f.threshold.unwrap_or(base.threshold),
                };
                (label, filter)
            })
            .collect(),
    };

    CameraConfig {
        name: name.to_string(),
        enabled: file.enabled.unwrap_or(true),
        ffmpeg,
        detect,
        motion,
        objects,
        attributes: file.attributes.unwrap_or_default(),
    }
}

fn secs(value: Option<f64>, default: f64) -> Duration {
    Duration::from_secs_f64(value.unwrap_or(default).max(0.0))
}

fn read_config_file(path: &Path) -> Result<NvrConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
