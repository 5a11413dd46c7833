use proptest::prelude::*;

use nvr_pipeline::config::CameraConfig;
use nvr_pipeline::frame::FrameShape;
use nvr_pipeline::region::{RegionSelector, REGION_DEDUP_IOU};
use nvr_pipeline::{BoundingBox, Detection, ObjectTracker};

fn tracker(max_disappeared: u32) -> ObjectTracker {
    let mut camera = CameraConfig::new("yard", 1280, 720, 5);
    camera.detect.max_disappeared = max_disappeared;
    ObjectTracker::new(camera.detect, camera.objects)
}

/// 20x20 person box centred on `(cx, cy)`.
fn person_at(cx: i32, cy: i32) -> Detection {
    Detection::new(
        "person",
        0.9,
        BoundingBox::new(cx - 10, cy - 10, cx + 10, cy + 10),
        BoundingBox::new(0, 0, 640, 640),
    )
}

fn id_near(t: &ObjectTracker, centroid: (i32, i32)) -> String {
    t.tracked_objects()
        .values()
        .find(|o| o.centroid == centroid)
        .map(|o| o.id.clone())
        .unwrap_or_else(|| panic!("no object at {:?}", centroid))
}

#[test]
fn nearest_objects_keep_their_ids() {
    let mut t = tracker(5);
    t.match_and_update(1.0, vec![person_at(100, 100), person_at(110, 110)]);
    let a = id_near(&t, (100, 100));
    let b = id_near(&t, (110, 110));

    t.match_and_update(2.0, vec![person_at(109, 110), person_at(101, 100)]);
    assert_eq!(t.len(), 2);
    assert_eq!(t.get(&a).unwrap().centroid, (101, 100));
    assert_eq!(t.get(&b).unwrap().centroid, (109, 110));
}

#[test]
fn closest_pair_is_consumed_first() {
    // A at x=100 and B at x=110; new boxes at x=109 and x=120. B takes 109
    // (distance 1) even though pairing A with it would cost less in total.
    let mut t = tracker(5);
    t.match_and_update(1.0, vec![person_at(100, 300), person_at(110, 300)]);
    let a = id_near(&t, (100, 300));
    let b = id_near(&t, (110, 300));

    t.match_and_update(2.0, vec![person_at(109, 300), person_at(120, 300)]);
    assert_eq!(t.get(&b).unwrap().centroid, (109, 300));
    assert_eq!(t.get(&a).unwrap().centroid, (120, 300));
}

#[test]
fn extra_detection_registers_and_missing_object_ages_out() {
    let mut t = tracker(2);
    t.match_and_update(1.0, vec![person_at(100, 100)]);
    let first = id_near(&t, (100, 100));

    t.match_and_update(2.0, vec![person_at(600, 400), person_at(102, 100)]);
    assert_eq!(t.len(), 2);
    assert_eq!(t.get(&first).unwrap().centroid, (102, 100));
    let second = id_near(&t, (600, 400));
    assert!(second.starts_with("2-"));

    t.match_and_update(3.0, vec![person_at(602, 400)]);
    assert_eq!(t.get(&first).unwrap().disappeared, 1);
    t.match_and_update(4.0, vec![person_at(604, 400)]);
    assert!(t.get(&first).is_none());
    assert_eq!(t.len(), 1);
    assert_eq!(t.get(&second).unwrap().frame_time, 4.0);
}

fn selector() -> RegionSelector {
    let mut selector = RegionSelector::new(FrameShape::new(1280, 720), 160);
    // Consume the startup sweep.
    selector.select(&[], &[], false);
    selector
}

fn boxes_in_frame() -> impl Strategy<Value = Vec<BoundingBox>> {
    prop::collection::vec(
        (4i32..300, 4i32..300, 0i32..1000, 0i32..1000).prop_map(|(w, h, fx, fy)| {
            let x1 = fx * (1280 - w) / 1000;
            let y1 = fy * (720 - h) / 1000;
            BoundingBox::new(x1, y1, x1 + w, y1 + h)
        }),
        0..12,
    )
}

proptest! {
    #[test]
    fn regions_are_square_sized_and_spread(
        objects in boxes_in_frame(),
        motion in boxes_in_frame(),
    ) {
        let mut selector = selector();
        let regions = selector.select(&objects, &motion, true);

        for region in &regions {
            let b = region.bounds;
            prop_assert_eq!(b.width(), b.height());
            prop_assert!(b.width() >= 160);
            prop_assert_eq!(b.width() % 4, 0);
            prop_assert!(b.x1 >= 0 && b.y1 >= 0);
        }
        for (i, a) in regions.iter().enumerate() {
            for other in &regions[i + 1..] {
                prop_assert!(a.bounds.iou(&other.bounds) <= REGION_DEDUP_IOU);
            }
        }
        for b in objects.iter().chain(motion.iter()) {
            prop_assert!(regions.iter().any(|r| r.bounds.contains(b)), "{:?} not covered", b);
        }
    }

    #[test]
    fn far_apart_objects_get_one_region_each(
        jitter in prop::collection::vec((0i32..40, 0i32..40), 6),
    ) {
        let centres = [(100, 100), (500, 100), (900, 100), (100, 500), (500, 500), (900, 500)];
        let objects: Vec<BoundingBox> = centres
            .iter()
            .zip(&jitter)
            .map(|(&(cx, cy), &(jx, jy))| {
                BoundingBox::new(cx + jx - 5, cy + jy - 5, cx + jx + 5, cy + jy + 5)
            })
            .collect();
        let mut selector = selector();
        let regions = selector.select(&objects, &[], false);
        prop_assert_eq!(regions.len(), objects.len());
        for b in &objects {
            prop_assert_eq!(regions.iter().filter(|r| r.bounds.contains(b)).count(), 1);
        }
    }
}
