//! Calibrating background-subtraction motion detector.
//!
//! Works on the luma plane downscaled to `frame_height` rows:
//!
//! 1. resize (nearest neighbour)
//! 2. optional contrast stretch using the average 4th/96th percentile of the
//!    last 50 frames
//! 3. zero masked pixels, gaussian blur (sigma 1)
//! 4. absdiff against the running average, threshold, 3x3 dilate
//! 5. external contours above `contour_area` become boxes at full resolution
//!
//! The running average only absorbs the current frame once motion has lasted
//! 10 frames; without motion it is always updated. The detector calibrates
//! until motion covers under 5% of the frame with at most 4 boxes, and
//! recalibrates when motion exceeds `lightning_threshold`.

pub mod mask;

use anyhow::Result;
use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology::dilate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::MotionSettings;
use crate::frame::FrameShape;
use crate::geometry::BoundingBox;
use crate::sync::AtomicF64;

const CONTRAST_HISTORY: usize = 50;
const CALIBRATED_MOTION_PCT: f64 = 0.05;
const CALIBRATED_MAX_BOXES: usize = 4;
const PERSISTENT_MOTION_FRAMES: u32 = 10;
const CALIBRATION_ALPHA: f32 = 0.2;
const BLUR_SIGMA: f32 = 1.0;

// ----------------------------------------------------------------------------
// PTZ motor state
// ----------------------------------------------------------------------------

/// Motor state published by a PTZ autotracker.
#[derive(Debug)]
pub struct PtzMotorState {
    autotracker_enabled: AtomicBool,
    motor_stopped: AtomicBool,
    stop_time: AtomicF64,
}

impl Default for PtzMotorState {
    fn default() -> Self {
        Self {
            autotracker_enabled: AtomicBool::new(false),
            motor_stopped: AtomicBool::new(true),
            stop_time: AtomicF64::new(0.0),
        }
    }
}

impl PtzMotorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_autotracker_enabled(&self, enabled: bool) {
        self.autotracker_enabled.store(enabled, Ordering::Release);
    }

    pub fn autotracker_enabled(&self) -> bool {
        self.autotracker_enabled.load(Ordering::Acquire)
    }

    pub fn start_moving(&self) {
        self.motor_stopped.store(false, Ordering::Release);
    }

    pub fn stop_moving(&self, at: f64) {
        self.stop_time.store(at);
        self.motor_stopped.store(true, Ordering::Release);
    }

    pub fn motor_stopped(&self) -> bool {
        self.motor_stopped.load(Ordering::Acquire)
    }

    pub fn stop_time(&self) -> f64 {
        self.stop_time.load()
    }

    /// True while the autotracker is panning or tilting.
    pub fn is_moving(&self) -> bool {
        self.autotracker_enabled() && !self.motor_stopped()
    }
}

// ----------------------------------------------------------------------------
// MotionDetector
// ----------------------------------------------------------------------------

pub struct MotionDetector {
    settings: MotionSettings,
    frame_shape: FrameShape,
    motion_width: u32,
    motion_height: u32,
    resize_factor: f64,
    avg_frame: Vec<f32>,
    motion_frame_count: u32,
    calibrating: bool,
    mask: Option<Vec<bool>>,
    contrast_values: [[u8; 2]; CONTRAST_HISTORY],
    contrast_index: usize,
    ptz: Arc<PtzMotorState>,
    last_stop_time: f64,
}

impl MotionDetector {
    pub fn new(
        frame_shape: FrameShape,
        settings: MotionSettings,
        ptz: Arc<PtzMotorState>,
    ) -> Result<Self> {
        let motion_height = settings.frame_height;
        let motion_width = ((motion_height as u64 * frame_shape.width as u64)
            / frame_shape.height.max(1) as u64)
            .max(1) as u32;
        let mask = mask::motion_mask(&settings.mask, frame_shape, motion_width, motion_height)?;
        Ok(Self {
            resize_factor: frame_shape.height as f64 / motion_height as f64,
            avg_frame: vec![0.0; motion_width as usize * motion_height as usize],
            motion_frame_count: 0,
            calibrating: true,
            mask,
            contrast_values: [[0, 255]; CONTRAST_HISTORY],
            contrast_index: 0,
            settings,
            frame_shape,
            motion_width,
            motion_height,
            ptz,
            last_stop_time: 0.0,
        })
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrating
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    /// `(width, height)` of the internal motion frame.
    pub fn motion_size(&self) -> (u32, u32) {
        (self.motion_width, self.motion_height)
    }

    /// Apply reloaded settings. A new frame height or mask rebuilds the
    /// detector and starts calibrating again.
    pub fn update_settings(&mut self, settings: MotionSettings) -> Result<()> {
        if settings.frame_height != self.settings.frame_height || settings.mask != self.settings.mask
        {
            *self = Self::new(self.frame_shape, settings, self.ptz.clone())?;
        } else {
            self.settings = settings;
        }
        Ok(())
    }

    /// Motion boxes for one frame, in detect-resolution pixels.
    pub fn detect(&mut self, luma: &[u8]) -> Vec<BoundingBox> {
        if !self.settings.enabled {
            return Vec::new();
        }
        let (w, h) = (self.frame_shape.width, self.frame_shape.height);

        if self.ptz.is_moving() {
            return vec![BoundingBox::new(
                (w as f64 * 0.1) as i32,
                (h as f64 * 0.1) as i32,
                (w as f64 * 0.9) as i32,
                (h as f64 * 0.9) as i32,
            )];
        }

        let plane = luma.get(..self.frame_shape.luma_size());
        let Some(gray) = plane.and_then(|plane| GrayImage::from_raw(w, h, plane.to_vec())) else {
            log::warn!(
                "motion: luma plane holds {} bytes, expected {}",
                luma.len(),
                self.frame_shape.luma_size()
            );
            return Vec::new();
        };
        let mut resized = imageops::resize(
            &gray,
            self.motion_width,
            self.motion_height,
            FilterType::Nearest,
        );

        if self.settings.improve_contrast {
            self.improve_contrast(&mut resized);
        }

        // Masked pixels are zeroed to match the average frame at startup.
        if let Some(mask) = &self.mask {
            for (pixel, masked) in resized.pixels_mut().zip(mask) {
                if *masked {
                    pixel.0[0] = 0;
                }
            }
        }

        let blurred = gaussian_blur_f32(&resized, BLUR_SIGMA);

        let mut thresh = blurred.clone();
        for (out, avg) in thresh.pixels_mut().zip(&self.avg_frame) {
            let avg = avg.round().clamp(0.0, 255.0) as u8;
            let delta = out.0[0].abs_diff(avg);
            out.0[0] = if delta > self.settings.threshold { 255 } else { 0 };
        }
        let dilated = dilate(&thresh, Norm::LInf, 1);

        let rf = self.resize_factor;
        let mut motion_boxes = Vec::new();
        let mut total_contour_area = 0.0;
        for contour in find_contours::<i32>(&dilated) {
            if contour.border_type != BorderType::Outer || contour.parent.is_some() {
                continue;
            }
            let area = polygon_area(&contour.points);
            total_contour_area += area;
            if area > self.settings.contour_area as f64 {
                let (mut x1, mut y1, mut x2, mut y2) = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
                for p in &contour.points {
                    x1 = x1.min(p.x);
                    y1 = y1.min(p.y);
                    x2 = x2.max(p.x);
                    y2 = y2.max(p.y);
                }
                motion_boxes.push(BoundingBox::new(
                    (x1 as f64 * rf) as i32,
                    (y1 as f64 * rf) as i32,
                    ((x2 + 1) as f64 * rf) as i32,
                    ((y2 + 1) as f64 * rf) as i32,
                ));
            }
        }
        let mut pct_motion =
            total_contour_area / (self.motion_width as f64 * self.motion_height as f64);

        // A PTZ that just finished moving starts from a fresh baseline and
        // calibrates again.
        let mut ptz_stopped = false;
        if self.ptz.autotracker_enabled() && self.ptz.motor_stopped() {
            let stop_time = self.ptz.stop_time();
            if stop_time != 0.0 && stop_time != self.last_stop_time {
                self.last_stop_time = stop_time;
                for (avg, pixel) in self.avg_frame.iter_mut().zip(blurred.pixels()) {
                    *avg = pixel.0[0] as f32;
                }
                motion_boxes.clear();
                pct_motion = 0.0;
                ptz_stopped = true;
            }
        }

        if !ptz_stopped
            && pct_motion < CALIBRATED_MOTION_PCT
            && motion_boxes.len() <= CALIBRATED_MAX_BOXES
        {
            self.calibrating = false;
        }
        if ptz_stopped || self.calibrating || pct_motion > self.settings.lightning_threshold {
            self.calibrating = true;
        }

        let alpha = if self.calibrating {
            CALIBRATION_ALPHA
        } else {
            self.settings.frame_alpha as f32
        };
        if !motion_boxes.is_empty() {
            self.motion_frame_count += 1;
            if self.motion_frame_count >= PERSISTENT_MOTION_FRAMES {
                self.accumulate(&blurred, alpha);
            }
        } else {
            self.accumulate(&blurred, alpha);
            self.motion_frame_count = 0;
        }

        motion_boxes
    }

    fn improve_contrast(&mut self, frame: &mut GrayImage) {
        let mut hist = [0u32; 256];
        for p in frame.pixels() {
            hist[p.0[0] as usize] += 1;
        }
        let count = frame.pixels().len();
        let min = percentile(&hist, count, 4.0) as u8;
        let max = percentile(&hist, count, 96.0) as u8;
        // Single-colour frames carry no contrast information.
        if min >= max {
            return;
        }
        self.contrast_values[self.contrast_index] = [min, max];
        self.contrast_index = (self.contrast_index + 1) % CONTRAST_HISTORY;

        let n = CONTRAST_HISTORY as f64;
        let avg_min = self.contrast_values.iter().map(|v| v[0] as f64).sum::<f64>() / n;
        let avg_max = self.contrast_values.iter().map(|v| v[1] as f64).sum::<f64>() / n;
        if avg_max <= avg_min {
            return;
        }
        for p in frame.pixels_mut() {
            let v = (p.0[0] as f64).clamp(avg_min, avg_max);
            p.0[0] = ((v - avg_min) / (avg_max - avg_min) * 255.0) as u8;
        }
    }

    fn accumulate(&mut self, frame: &GrayImage, alpha: f32) {
        for (avg, pixel) in self.avg_frame.iter_mut().zip(frame.pixels()) {
            *avg = (1.0 - alpha) * *avg + alpha * pixel.0[0] as f32;
        }
    }
}

/// Linear-interpolated percentile over a 256-bin histogram of `count` samples.
fn percentile(hist: &[u32; 256], count: usize, pct: f64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let rank = pct / 100.0 * (count - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let v_lo = nth_value(hist, lo);
    let v_hi = nth_value(hist, hi);
    v_lo + (v_hi - v_lo) * (rank - lo as f64)
}

fn nth_value(hist: &[u32; 256], n: usize) -> f64 {
    let mut seen = 0usize;
    for (value, c) in hist.iter().enumerate() {
        seen += *c as usize;
        if seen > n {
            return value as f64;
        }
    }
    255.0
}

/// Shoelace area of a closed contour.
fn polygon_area(points: &[imageproc::point::Point<i32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0i64;
    for (i, a) in points.iter().enumerate() {
        let b = &points[(i + 1) % points.len()];
        twice += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
    }
    twice.abs() as f64 / 2.0
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
