//! Turn region-relative detector rows into frame detections.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::channel::RegionDetection;
use crate::config::ObjectSettings;
use crate::frame::FrameShape;
use crate::geometry::BoundingBox;

pub const NMS_SCORE_THRESHOLD: f32 = 0.5;
pub const NMS_IOU_THRESHOLD: f64 = 0.4;
/// Pixels from an interior region edge at which a box counts as clipped.
pub const CLIP_MARGIN: i32 = 5;
pub const CLIPPED_CONFIDENCE_FACTOR: f32 = 0.6;

/// One detection in frame pixel space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
    pub area: i64,
    pub ratio: f64,
    /// Region the detector looked at when it found this object.
    pub region: BoundingBox,
}

impl Detection {
    pub fn new(label: &str, score: f32, bbox: BoundingBox, region: BoundingBox) -> Self {
        Self {
            label: label.to_string(),
            score,
            bbox,
            area: bbox.area(),
            ratio: bbox.ratio(),
            region,
        }
    }
}

/// Map rows found inside `region` onto the frame and drop the ones the camera
/// does not want (unknown label, object filters).
pub fn to_frame_detections(
    rows: &[RegionDetection],
    region: &BoundingBox,
    frame: FrameShape,
    objects: &ObjectSettings,
    detectable: &[String],
) -> Vec<Detection> {
    let size = region.width() as f32;
    let (fw, fh) = (frame.width as i32, frame.height as i32);
    let mut detections = Vec::new();
    for row in rows {
        let [y1, x1, y2, x2] = row.bbox;
        let x_min = ((x1 * size) as i32 + region.x1).max(0);
        let y_min = ((y1 * size) as i32 + region.y1).max(0);
        let x_max = ((x2 * size) as i32 + region.x1).min(fw - 1);
        let y_max = ((y2 * size) as i32 + region.y1).min(fh - 1);
        if x_min >= fw - 1 || y_min >= fh - 1 {
            continue;
        }
        let detection = Detection::new(
            &row.label,
            row.score,
            BoundingBox::new(x_min, y_min, x_max, y_max),
            *region,
        );
        if filtered(&detection, objects, detectable) {
            continue;
        }
        detections.push(detection);
    }
    detections
}

fn filtered(detection: &Detection, objects: &ObjectSettings, detectable: &[String]) -> bool {
    if !detectable.iter().any(|label| *label == detection.label) {
        return true;
    }
    let filter = objects.filter_for(&detection.label);
    detection.area < filter.min_area
        || detection.area > filter.max_area
        || detection.score < filter.min_score
        || detection.ratio < filter.min_ratio
        || detection.ratio > filter.max_ratio
}

/// True when the box hugs an edge of its region that is not also a frame edge.
pub fn clipped_by_region(detection: &Detection, frame: FrameShape) -> bool {
    let b = &detection.bbox;
    let r = &detection.region;
    let (fw, fh) = (frame.width as i32, frame.height as i32);
    (r.x1 > CLIP_MARGIN && b.x1 - r.x1 <= CLIP_MARGIN)
        || (r.y1 > CLIP_MARGIN && b.y1 - r.y1 <= CLIP_MARGIN)
        || (fw - r.x2 > CLIP_MARGIN && r.x2 - b.x2 <= CLIP_MARGIN)
        || (fh - r.y2 > CLIP_MARGIN && r.y2 - b.y2 <= CLIP_MARGIN)
}

/// Per-label non-maximum suppression across every region of a frame.
///
/// Clipped boxes compete with reduced confidence so that a full view of the
/// same object from an overlapping region wins. Kept detections keep their
/// original score.
pub fn reduce_detections(frame: FrameShape, detections: Vec<Detection>) -> Vec<Detection> {
    let mut groups: BTreeMap<String, Vec<Detection>> = BTreeMap::new();
    for detection in detections {
        groups
            .entry(detection.label.clone())
            .or_default()
            .push(detection);
    }

    let mut selected = Vec::new();
    for group in groups.into_values() {
        let mut ranked: Vec<(f32, Detection)> = group
            .into_iter()
            .map(|d| {
                let confidence = if clipped_by_region(&d, frame) {
                    d.score * CLIPPED_CONFIDENCE_FACTOR
                } else {
                    d.score
                };
                (confidence, d)
            })
            .filter(|(confidence, _)| *confidence >= NMS_SCORE_THRESHOLD)
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut suppressed = vec![false; ranked.len()];
        for i in 0..ranked.len() {
            if suppressed[i] {
                continue;
            }
            for j in (i + 1)..ranked.len() {
                if !suppressed[j] && ranked[i].1.bbox.iou(&ranked[j].1.bbox) > NMS_IOU_THRESHOLD {
                    suppressed[j] = true;
                }
            }
        }
        selected.extend(
            ranked
                .into_iter()
                .zip(suppressed)
                .filter(|(_, gone)| !gone)
                .map(|((_, d), _)| d),
        );
    }
    selected
}
