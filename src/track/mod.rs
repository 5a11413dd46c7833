//! Greedy nearest-centroid object tracker.
//!
//! Detections are grouped by label. Within a label every (tracked, new) pair
//! is ranked by centroid distance and consumed greedily from the closest
//! pair: each tracked object and each detection matches at most once. This is
//! deliberately not an optimal assignment.
//!
//! Unmatched tracked objects accumulate `disappeared` and are dropped once it
//! reaches `max_disappeared`. Unmatched detections become new objects.

mod object;

pub use object::{new_object_id, ObjectAttribute, TrackedObject, POSITION_IOU, SCORE_HISTORY};

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::{DetectSettings, ObjectSettings};
use crate::detect::Detection;
use crate::geometry::BoundingBox;
use object::PositionBox;

pub struct ObjectTracker {
    detect: DetectSettings,
    objects: ObjectSettings,
    tracked: BTreeMap<String, TrackedObject>,
    positions: HashMap<String, PositionBox>,
    untracked_object_boxes: Vec<BoundingBox>,
}

impl ObjectTracker {
    pub fn new(detect: DetectSettings, objects: ObjectSettings) -> Self {
        Self {
            detect,
            objects,
            tracked: BTreeMap::new(),
            positions: HashMap::new(),
            untracked_object_boxes: Vec::new(),
        }
    }

    pub fn update_settings(&mut self, detect: DetectSettings) {
        self.detect = detect;
    }

    pub fn detect_settings(&self) -> &DetectSettings {
        &self.detect
    }

    pub fn tracked_objects(&self) -> &BTreeMap<String, TrackedObject> {
        &self.tracked
    }

    pub fn get(&self, id: &str) -> Option<&TrackedObject> {
        self.tracked.get(id)
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Boxes of detections that are not tracked (attributes) from the last
    /// frame on which detection ran.
    pub fn untracked_object_boxes(&self) -> &[BoundingBox] {
        &self.untracked_object_boxes
    }

    pub fn set_untracked_object_boxes(&mut self, boxes: Vec<BoundingBox>) {
        self.untracked_object_boxes = boxes;
    }

    /// Correlate this frame's detections with tracked state.
    pub fn match_and_update(&mut self, frame_time: f64, detections: Vec<Detection>) {
        let mut groups: BTreeMap<String, Vec<Detection>> = BTreeMap::new();
        for detection in detections {
            groups
                .entry(detection.label.clone())
                .or_default()
                .push(detection);
        }

        let mut matched: HashSet<String> = HashSet::new();
        for (label, group) in &groups {
            let current: Vec<(String, (i32, i32))> = self
                .tracked
                .values()
                .filter(|o| &o.label == label)
                .map(|o| (o.id.clone(), o.centroid))
                .collect();

            let mut pairs: Vec<(f64, usize, usize)> = Vec::with_capacity(current.len() * group.len());
            for (row, (_, centroid)) in current.iter().enumerate() {
                for (col, detection) in group.iter().enumerate() {
                    pairs.push((distance(*centroid, detection.bbox.centroid()), row, col));
                }
            }
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

            let mut used_rows = vec![false; current.len()];
            let mut used_cols = vec![false; group.len()];
            for (_, row, col) in pairs {
                if used_rows[row] || used_cols[col] {
                    continue;
                }
                used_rows[row] = true;
                used_cols[col] = true;
                let id = &current[row].0;
                matched.insert(id.clone());
                self.update(id, &group[col], frame_time);
            }

            for (col, detection) in group.iter().enumerate() {
                if !used_cols[col] {
                    let id = self.register(detection, frame_time);
                    matched.insert(id);
                }
            }
        }

        let missing: Vec<String> = self
            .tracked
            .keys()
            .filter(|id| !matched.contains(*id))
            .cloned()
            .collect();
        for id in missing {
            let gone = match self.tracked.get_mut(&id) {
                Some(object) => {
                    object.disappeared += 1;
                    object.frame_time = frame_time;
                    object.disappeared >= self.detect.max_disappeared
                }
                None => false,
            };
            if gone {
                self.deregister(&id);
            }
        }
    }

    /// Advance every object to `frame_time` on frames where no detection ran.
    /// Objects are assumed not to have moved.
    pub fn update_frame_times(&mut self, frame_time: f64) {
        let ids: Vec<String> = self.tracked.keys().cloned().collect();
        for id in ids {
            if let Some(object) = self.tracked.get_mut(&id) {
                object.frame_time = frame_time;
                object.motionless_count += 1;
            }
            if self.is_expired(&id) {
                self.deregister(&id);
            }
        }
    }

    /// Flag the given objects as stationary and clear the flag on the rest.
    pub fn set_stationary(&mut self, ids: &HashSet<String>) {
        for (id, object) in self.tracked.iter_mut() {
            object.stationary = ids.contains(id);
        }
    }

    /// Attach attribute detections lying inside each object's box.
    pub fn attach_attributes(&mut self, attributes: &[Detection]) {
        for object in self.tracked.values_mut() {
            object.attributes = attributes
                .iter()
                .filter(|a| object.bbox.contains(&a.bbox))
                .map(|a| ObjectAttribute {
                    label: a.label.clone(),
                    score: a.score,
                    bbox: a.bbox,
                })
                .collect();
        }
    }

    /// Drop every tracked object, returning their final state.
    pub fn end_all(&mut self) -> Vec<TrackedObject> {
        self.positions.clear();
        self.untracked_object_boxes.clear();
        std::mem::take(&mut self.tracked).into_values().collect()
    }

    fn register(&mut self, detection: &Detection, frame_time: f64) -> String {
        let threshold = self.objects.filter_for(&detection.label).threshold;
        let object = TrackedObject::register(detection, frame_time, threshold);
        let id = object.id.clone();
        log::debug!("tracking {} {}", object.label, id);
        self.positions.insert(id.clone(), PositionBox::new(&detection.bbox));
        self.tracked.insert(id.clone(), object);
        id
    }

    fn deregister(&mut self, id: &str) {
        self.positions.remove(id);
        if let Some(object) = self.tracked.remove(id) {
            log::debug!("lost {} {}", object.label, id);
        }
    }

    fn update(&mut self, id: &str, detection: &Detection, frame_time: f64) {
        let stayed = match self.positions.get_mut(id) {
            Some(position) => position.update(&detection.bbox),
            None => {
                self.positions
                    .insert(id.to_string(), PositionBox::new(&detection.bbox));
                false
            }
        };
        let threshold = self.objects.filter_for(&detection.label).threshold;
        let stationary_threshold = self.detect.stationary.threshold;
        let Some(object) = self.tracked.get_mut(id) else {
            return;
        };
        if stayed {
            object.motionless_count += 1;
        } else {
            // The first move always counts; later ones only after a rest.
            if object.position_changes == 0 || object.motionless_count >= stationary_threshold {
                object.position_changes += 1;
            }
            object.motionless_count = 0;
        }
        object.apply(detection, frame_time, threshold);
        if stayed && self.is_expired(id) {
            self.deregister(id);
        }
    }

    /// A stationary object outstays `stationary.max_frames` for its label.
    fn is_expired(&self, id: &str) -> bool {
        let Some(object) = self.tracked.get(id) else {
            return false;
        };
        let stationary = &self.detect.stationary;
        match stationary.max_frames_for(&object.label) {
            Some(max_frames) => {
                object.motionless_count.saturating_sub(stationary.threshold) > max_frames
            }
            None => false,
        }
    }
}

fn distance(a: (i32, i32), b: (i32, i32)) -> f64 {
    let dx = (a.0 - b.0) as f64;
    let dy = (a.1 - b.1) as f64;
    (dx * dx + dy * dy).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CameraConfig;

    fn tracker(max_disappeared: u32) -> ObjectTracker {
        let mut camera = CameraConfig::new("front", 1280, 720, 5);
        camera.detect.max_disappeared = max_disappeared;
        camera.detect.stationary.threshold = 3;
        camera.objects.track.push("car".to_string());
        ObjectTracker::new(camera.detect, camera.objects)
    }

    fn det(label: &str, b: (i32, i32, i32, i32)) -> Detection {
        Detection::new(label, 0.9, BoundingBox::from(b), BoundingBox::new(0, 0, 640, 640))
    }

    #[test]
    fn unmatched_detections_register() {
        let mut t = tracker(5);
        t.match_and_update(1.0, vec![det("person", (0, 0, 20, 40)), det("car", (100, 100, 200, 160))]);
        assert_eq!(t.len(), 2);
        let person = t.tracked_objects().values().find(|o| o.label == "person").unwrap();
        assert!(person.id.starts_with("1-"));
        assert_eq!(person.start_time, 1.0);
        assert_eq!(person.centroid, (10, 20));
    }

    #[test]
    fn matching_stays_within_label() {
        let mut t = tracker(5);
        t.match_and_update(1.0, vec![det("person", (0, 0, 20, 40))]);
        let person_id = t.tracked_objects().keys().next().unwrap().clone();
        // A car appears exactly where the person was; the person is missing.
        t.match_and_update(2.0, vec![det("car", (0, 0, 20, 40))]);
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&person_id).unwrap().disappeared, 1);
    }

    #[test]
    fn deregisters_after_max_disappeared() {
        let mut t = tracker(3);
        t.match_and_update(1.0, vec![det("person", (0, 0, 20, 40))]);
        t.match_and_update(2.0, Vec::new());
        t.match_and_update(3.0, Vec::new());
        assert_eq!(t.len(), 1);
        t.match_and_update(4.0, Vec::new());
        assert!(t.is_empty());
    }

    #[test]
    fn match_resets_disappeared() {
        let mut t = tracker(3);
        t.match_and_update(1.0, vec![det("person", (0, 0, 20, 40))]);
        t.match_and_update(2.0, Vec::new());
        t.match_and_update(3.0, vec![det("person", (2, 0, 22, 40))]);
        let object = t.tracked_objects().values().next().unwrap();
        assert_eq!(object.disappeared, 0);
        assert_eq!(object.frame_time, 3.0);
    }

    #[test]
    fn still_object_counts_motionless_then_moves() {
        let mut t = tracker(10);
        t.match_and_update(1.0, vec![det("car", (100, 100, 200, 160))]);
        for i in 0..4 {
            t.match_and_update(2.0 + i as f64, vec![det("car", (101, 100, 201, 160))]);
        }
        let car = t.tracked_objects().values().next().unwrap().clone();
        assert_eq!(car.motionless_count, 4);
        assert_eq!(car.position_changes, 0);

        t.match_and_update(10.0, vec![det("car", (300, 100, 400, 160))]);
        let car = t.get(&car.id).unwrap();
        assert_eq!(car.motionless_count, 0);
        assert_eq!(car.position_changes, 1);
    }

    #[test]
    fn stationary_objects_expire() {
        let mut t = tracker(10);
        let mut detect = t.detect_settings().clone();
        detect.stationary.max_frames_default = Some(2);
        t.update_settings(detect);
        t.match_and_update(1.0, vec![det("car", (100, 100, 200, 160))]);
        // threshold 3 + max 2: gone once motionless exceeds 5.
        for i in 0..5 {
            t.update_frame_times(2.0 + i as f64);
        }
        assert_eq!(t.len(), 1);
        t.update_frame_times(7.0);
        assert!(t.is_empty());
    }

    #[test]
    fn attributes_attach_to_enclosing_object() {
        let mut t = tracker(5);
        t.match_and_update(1.0, vec![det("person", (0, 0, 100, 200))]);
        t.attach_attributes(&[det("face", (20, 10, 60, 50)), det("face", (300, 300, 340, 340))]);
        let person = t.tracked_objects().values().next().unwrap();
        assert_eq!(person.attributes.len(), 1);
        assert_eq!(person.attributes[0].bbox, BoundingBox::new(20, 10, 60, 50));
    }

    #[test]
    fn end_all_clears_state() {
        let mut t = tracker(5);
        t.match_and_update(1.0, vec![det("person", (0, 0, 20, 40))]);
        t.set_untracked_object_boxes(vec![BoundingBox::new(0, 0, 5, 5)]);
        let ended = t.end_all();
        assert_eq!(ended.len(), 1);
        assert!(t.is_empty());
        assert!(t.untracked_object_boxes().is_empty());
    }
}
