use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::geometry::BoundingBox;

pub const SCORE_HISTORY: usize = 10;
pub const POSITION_HISTORY: usize = 10;
/// Below this IoU against the position box an object is considered moved.
pub const POSITION_IOU: f64 = 0.6;

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_SUFFIX_LEN: usize = 6;

/// `"{frame_time}-{6 random lowercase alphanumerics}"`.
pub fn new_object_id(frame_time: f64) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect();
    format!("{}-{}", frame_time, suffix)
}

/// An attribute detection found inside a tracked object's box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectAttribute {
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
}

/// Snapshot of one tracked object, handed to pipeline consumers as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: String,
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
    pub area: i64,
    pub ratio: f64,
    pub region: BoundingBox,
    pub centroid: (i32, i32),
    pub start_time: f64,
    pub frame_time: f64,
    pub motionless_count: u32,
    pub disappeared: u32,
    pub position_changes: u32,
    pub score_history: Vec<f32>,
    /// Median of the score history, zero padded to three samples.
    pub computed_score: f32,
    pub top_score: f32,
    pub false_positive: bool,
    pub stationary: bool,
    /// Where the object is expected next frame.
    pub estimate: BoundingBox,
    pub attributes: Vec<ObjectAttribute>,
}

impl TrackedObject {
    pub(crate) fn register(detection: &Detection, frame_time: f64, threshold: f32) -> Self {
        let mut object = Self {
            id: new_object_id(frame_time),
            label: detection.label.clone(),
            score: detection.score,
            bbox: detection.bbox,
            area: detection.area,
            ratio: detection.ratio,
            region: detection.region,
            centroid: detection.bbox.centroid(),
            start_time: frame_time,
            frame_time,
            motionless_count: 0,
            disappeared: 0,
            position_changes: 0,
            score_history: Vec::new(),
            computed_score: 0.0,
            top_score: 0.0,
            false_positive: true,
            stationary: false,
            estimate: detection.bbox,
            attributes: Vec::new(),
        };
        object.record_score(detection.score, threshold);
        object
    }

    /// Replace the live fields with a newly matched detection.
    pub(crate) fn apply(&mut self, detection: &Detection, frame_time: f64, threshold: f32) {
        let previous = self.bbox;
        let b = detection.bbox;
        self.estimate = BoundingBox::new(
            b.x1 + (b.x1 - previous.x1),
            b.y1 + (b.y1 - previous.y1),
            b.x2 + (b.x2 - previous.x2),
            b.y2 + (b.y2 - previous.y2),
        );
        self.score = detection.score;
        self.bbox = b;
        self.area = detection.area;
        self.ratio = detection.ratio;
        self.region = detection.region;
        self.centroid = b.centroid();
        self.frame_time = frame_time;
        self.disappeared = 0;
        self.record_score(detection.score, threshold);
    }

    fn record_score(&mut self, score: f32, threshold: f32) {
        self.score_history.push(score);
        if self.score_history.len() > SCORE_HISTORY {
            let excess = self.score_history.len() - SCORE_HISTORY;
            self.score_history.drain(..excess);
        }
        self.computed_score = median_score(&self.score_history);
        if self.computed_score > self.top_score {
            self.top_score = self.computed_score;
        }
        self.false_positive = self.computed_score < threshold;
    }
}

fn median_score(history: &[f32]) -> f32 {
    let mut scores = history.to_vec();
    scores.resize(scores.len().max(3), 0.0);
    scores.sort_by(|a, b| a.total_cmp(b));
    let mid = scores.len() / 2;
    if scores.len() % 2 == 0 {
        (scores[mid - 1] + scores[mid]) / 2.0
    } else {
        scores[mid]
    }
}

// ----------------------------------------------------------------------------
// Position box
// ----------------------------------------------------------------------------

/// Robust box of where an object has been sitting: 15th percentile of the
/// recent mins and 85th of the maxes, over up to 10 observations.
#[derive(Clone, Debug, Default)]
pub(crate) struct PositionBox {
    xmins: Vec<f64>,
    ymins: Vec<f64>,
    xmaxs: Vec<f64>,
    ymaxs: Vec<f64>,
    current: [f64; 4],
}

impl PositionBox {
    pub(crate) fn new(b: &BoundingBox) -> Self {
        let mut position = Self::default();
        position.reset(b);
        position
    }

    fn reset(&mut self, b: &BoundingBox) {
        self.xmins = vec![b.x1 as f64];
        self.ymins = vec![b.y1 as f64];
        self.xmaxs = vec![b.x2 as f64];
        self.ymaxs = vec![b.y2 as f64];
        self.current = [b.x1 as f64, b.y1 as f64, b.x2 as f64, b.y2 as f64];
    }

    /// Feed a new observation. Returns `false` when the object moved away from
    /// its position box (which then restarts from this box).
    pub(crate) fn update(&mut self, b: &BoundingBox) -> bool {
        let observed = [b.x1 as f64, b.y1 as f64, b.x2 as f64, b.y2 as f64];
        if iou(&self.current, &observed) < POSITION_IOU {
            self.reset(b);
            return false;
        }
        if self.xmins.len() < POSITION_HISTORY {
            self.xmins.push(observed[0]);
            self.ymins.push(observed[1]);
            self.xmaxs.push(observed[2]);
            self.ymaxs.push(observed[3]);
            self.current = [
                percentile(&self.xmins, 15.0),
                percentile(&self.ymins, 15.0),
                percentile(&self.xmaxs, 85.0),
                percentile(&self.ymaxs, 85.0),
            ];
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> [f64; 4] {
        self.current
    }
}

/// Linear-interpolated percentile.
fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

fn iou(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0]) + 1.0).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1]) + 1.0).max(0.0);
    let inter = iw * ih;
    let area_a = (a[2] - a[0] + 1.0) * (a[3] - a[1] + 1.0);
    let area_b = (b[2] - b[0] + 1.0) * (b[3] - b[1] + 1.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_frame_time_and_suffix() {
        let id = new_object_id(1700000000.5);
        let (time, suffix) = id.rsplit_once('-').unwrap();
        assert_eq!(time, "1700000000.5");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.bytes().all(|c| ID_CHARSET.contains(&c)));
    }

    #[test]
    fn median_pads_short_history() {
        assert_eq!(median_score(&[0.9]), 0.0);
        assert_eq!(median_score(&[0.9, 0.8]), 0.8);
        assert!((median_score(&[0.9, 0.8, 0.7, 0.6]) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn score_history_is_capped() {
        let region = BoundingBox::new(0, 0, 320, 320);
        let d = Detection::new("person", 0.9, BoundingBox::new(10, 10, 50, 90), region);
        let mut object = TrackedObject::register(&d, 1.0, 0.7);
        assert!(object.false_positive);
        for i in 0..15 {
            object.apply(&d, 2.0 + i as f64, 0.7);
        }
        assert_eq!(object.score_history.len(), SCORE_HISTORY);
        assert_eq!(object.computed_score, 0.9);
        assert_eq!(object.top_score, 0.9);
        assert!(!object.false_positive);
    }

    #[test]
    fn estimate_extrapolates_last_move() {
        let region = BoundingBox::new(0, 0, 320, 320);
        let first = Detection::new("car", 0.8, BoundingBox::new(10, 10, 50, 50), region);
        let second = Detection::new("car", 0.8, BoundingBox::new(20, 15, 60, 55), region);
        let mut object = TrackedObject::register(&first, 1.0, 0.7);
        assert_eq!(object.estimate, first.bbox);
        object.apply(&second, 2.0, 0.7);
        assert_eq!(object.estimate, BoundingBox::new(30, 20, 70, 60));
    }

    #[test]
    fn position_box_tracks_jitter_and_resets_on_move() {
        let mut position = PositionBox::new(&BoundingBox::new(100, 100, 200, 300));
        assert!(position.update(&BoundingBox::new(102, 98, 203, 301)));
        assert!(position.update(&BoundingBox::new(99, 101, 198, 299)));
        let [x1, _, x2, _] = position.current();
        assert!((99.0..=102.0).contains(&x1));
        assert!((198.0..=203.0).contains(&x2));

        assert!(!position.update(&BoundingBox::new(400, 100, 500, 300)));
        assert_eq!(position.current(), [400.0, 100.0, 500.0, 300.0]);
    }

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0, 5.0], 50.0), 3.0);
        assert!((percentile(&[0.0, 10.0], 15.0) - 1.5).abs() < 1e-9);
    }
}
