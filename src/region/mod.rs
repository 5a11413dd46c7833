//! Detection region selection.
//!
//! Turns the boxes worth looking at on a frame into a small set of square
//! regions for the detector:
//!
//! - each box gets a boundary (the box grown to the region size it would
//!   plausibly occupy); boxes whose boundaries overlap are clustered with
//!   union-find
//! - each cluster becomes one square region of side `>= min_region`,
//!   `>= longest edge`, a multiple of 4, shifted into the frame
//! - motion-only clusters are resized from the region grid when their naive
//!   size is smaller than the grid cell expects
//! - regions are merged until no two overlap with IoU above
//!   `REGION_DEDUP_IOU`; clusters already inside a selected region are dropped
//! - the first frame also gets a sweep of tiles over the whole frame
//!
//! Priority when merging: tracked objects, then motion, then startup tiles.

pub mod grid;

use serde::{Deserialize, Serialize};

use crate::frame::FrameShape;
use crate::geometry::BoundingBox;
use grid::RegionGrid;

pub use grid::{GridCell, NormalizedBox, RegionGridSource, RegionGridStore, GRID_SIZE};

/// Growth applied to a cluster's longest edge when sizing its region.
pub const REGION_MULTIPLIER: f64 = 1.35;
/// Largest IoU allowed between two selected regions.
pub const REGION_DEDUP_IOU: f64 = 0.25;

/// Why a region was selected. Ordered by priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionSource {
    Tracked,
    Motion,
    Startup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionRegion {
    pub bounds: BoundingBox,
    pub source: RegionSource,
}

impl DetectionRegion {
    pub fn size(&self) -> i32 {
        self.bounds.width()
    }
}

fn floor4(value: i32) -> i32 {
    value.div_euclid(4) * 4
}

fn ceil4(value: i32) -> i32 {
    (value + 3).div_euclid(4) * 4
}

fn clamp_offset(offset: i32, frame_len: i32, size: i32) -> i32 {
    if offset < 0 {
        0
    } else if offset > frame_len - size {
        (frame_len - size).max(0)
    } else {
        offset
    }
}

/// Square region around `b`: side is the longest edge times `multiplier`,
/// never below `min_region` or the edge itself, rounded to a multiple of 4.
/// The region is shifted to lie inside the frame; a region larger than the
/// frame starts at the frame origin.
pub fn calculate_region(frame: FrameShape, b: &BoundingBox, min_region: i32, multiplier: f64) -> BoundingBox {
    let longest = b.longest_edge().max(0);
    let size = floor4((longest as f64 * multiplier) as i32)
        .max(ceil4(longest))
        .max(ceil4(min_region));
    let cx = (b.x1 + b.x2) as f64 / 2.0;
    let cy = (b.y1 + b.y2) as f64 / 2.0;
    let x = clamp_offset((cx - size as f64 / 2.0) as i32, frame.width as i32, size);
    let y = clamp_offset((cy - size as f64 / 2.0) as i32, frame.height as i32, size);
    BoundingBox::new(x, y, x + size, y + size)
}

/// Area a box may plausibly influence when clustering: assumes the box fills
/// about a tenth of its region.
pub fn cluster_boundary(b: &BoundingBox, min_region: i32) -> BoundingBox {
    let (w, h) = (b.width() as f64, b.height() as f64);
    let max_region_area = (w * h).abs() / 0.1;
    let max_region_size = (min_region as f64).max(max_region_area.sqrt().floor());
    let cx = w / 2.0 + b.x1 as f64;
    let cy = h / 2.0 + b.y1 as f64;
    let dx = (max_region_size - w / 2.0 * 1.1).trunc();
    let dy = (max_region_size - h / 2.0 * 1.1).trunc();
    BoundingBox::new(
        (cx - dx) as i32,
        (cy - dy) as i32,
        (cx + dx) as i32,
        (cy + dy) as i32,
    )
}

/// Group boxes whose boundaries overlap, transitively. Returns index groups
/// in order of their first member.
pub fn cluster_boxes(boxes: &[BoundingBox], min_region: i32) -> Vec<Vec<usize>> {
    let boundaries: Vec<BoundingBox> = boxes
        .iter()
        .map(|b| cluster_boundary(b, min_region))
        .collect();
    let mut parent: Vec<usize> = (0..boxes.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..boxes.len() {
        for j in (i + 1)..boxes.len() {
            if boundaries[i].intersection_area(&boundaries[j]) > 0 {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a.max(b)] = a.min(b);
                }
            }
        }
    }

    let mut clusters: Vec<Vec<usize>> = Vec::new();
    let mut root_slot: Vec<Option<usize>> = vec![None; boxes.len()];
    for i in 0..boxes.len() {
        let root = find(&mut parent, i);
        match root_slot[root] {
            Some(slot) => clusters[slot].push(i),
            None => {
                root_slot[root] = Some(clusters.len());
                clusters.push(vec![i]);
            }
        }
    }
    clusters
}

/// Region for a cluster, sized from the grid cell under its centre when the
/// naive size is below what that cell usually needs.
pub fn region_from_grid(
    frame: FrameShape,
    cluster: &BoundingBox,
    min_region: i32,
    grid: &RegionGrid,
) -> BoundingBox {
    let calculated = calculate_region(frame, cluster, min_region, REGION_MULTIPLIER);
    let cell = grid.cell_at(frame, cluster.centroid());
    if cell.sizes.is_empty() {
        return calculated;
    }
    let relative = calculated.width() as f64 / frame.width.max(1) as f64;
    // Inside the expected range, or already larger than expected.
    if relative >= cell.mean - cell.std_dev {
        return calculated;
    }
    let size = (cell.mean * frame.width as f64) as i32;
    calculate_region(frame, cluster, size.max(min_region), 1.0)
}

/// Start offsets of startup tiles along one axis. A trailing tile is pulled
/// flush with the frame edge unless that would overlap its neighbour too much.
fn tile_offsets(frame_len: i32, tile: i32) -> Vec<i32> {
    let count = ((frame_len + tile - 1) / tile).max(1);
    let mut offsets: Vec<i32> = (0..count).map(|i| i * tile).collect();
    if count > 1 {
        let last = offsets.len() - 1;
        let previous = offsets[last - 1];
        let flush = frame_len - tile;
        let overlap = (previous + tile - flush) as f64;
        let iou = overlap / (2.0 * tile as f64 - overlap);
        if iou <= REGION_DEDUP_IOU {
            offsets[last] = flush;
        }
    }
    offsets
}

// ----------------------------------------------------------------------------
// RegionSelector
// ----------------------------------------------------------------------------

struct Selected {
    region: DetectionRegion,
    members: Vec<BoundingBox>,
    grid_sized: bool,
}

/// Per-camera region selection state.
pub struct RegionSelector {
    frame: FrameShape,
    min_region: i32,
    startup_tile: i32,
    grid: RegionGrid,
    startup_pending: bool,
}

impl RegionSelector {
    pub fn new(frame: FrameShape, min_region: i32) -> Self {
        let min_region = ceil4(min_region.max(4));
        Self {
            frame,
            min_region,
            startup_tile: min_region * 2,
            grid: RegionGrid::empty(),
            startup_pending: true,
        }
    }

    pub fn min_region(&self) -> i32 {
        self.min_region
    }

    pub fn grid(&self) -> &RegionGrid {
        &self.grid
    }

    pub fn set_grid(&mut self, grid: RegionGrid) {
        self.grid = grid;
    }

    /// Sweep the whole frame again on the next call.
    pub fn request_startup_scan(&mut self) {
        self.startup_pending = true;
    }

    /// Regions for one frame.
    ///
    /// `object_boxes` are tracked (or untracked candidate) boxes; `motion_boxes`
    /// are only considered when `include_motion` is set.
    pub fn select(
        &mut self,
        object_boxes: &[BoundingBox],
        motion_boxes: &[BoundingBox],
        include_motion: bool,
    ) -> Vec<DetectionRegion> {
        let mut selected: Vec<Selected> = Vec::new();

        for cluster in cluster_boxes(object_boxes, self.min_region) {
            let members = cluster.iter().map(|&i| object_boxes[i]).collect();
            self.insert(&mut selected, members, RegionSource::Tracked, false);
        }

        if include_motion {
            let uncovered: Vec<BoundingBox> = motion_boxes
                .iter()
                .filter(|b| !selected.iter().any(|s| s.region.bounds.contains(b)))
                .copied()
                .collect();
            for cluster in cluster_boxes(&uncovered, self.min_region) {
                let members = cluster.iter().map(|&i| uncovered[i]).collect();
                self.insert(&mut selected, members, RegionSource::Motion, true);
            }
        }

        if self.startup_pending {
            self.startup_pending = false;
            for tile in self.startup_tiles() {
                let redundant = selected.iter().any(|s| {
                    s.region.bounds.contains(&tile) || s.region.bounds.iou(&tile) > REGION_DEDUP_IOU
                });
                if !redundant {
                    selected.push(Selected {
                        region: DetectionRegion {
                            bounds: tile,
                            source: RegionSource::Startup,
                        },
                        members: vec![tile],
                        grid_sized: false,
                    });
                }
            }
        }

        selected.into_iter().map(|s| s.region).collect()
    }

    /// Deterministic tiling of the frame used on the first run.
    pub fn startup_tiles(&self) -> Vec<BoundingBox> {
        let tile = self.startup_tile;
        let xs = tile_offsets(self.frame.width as i32, tile);
        let ys = tile_offsets(self.frame.height as i32, tile);
        let mut tiles = Vec::with_capacity(xs.len() * ys.len());
        for &y in &ys {
            for &x in &xs {
                tiles.push(BoundingBox::new(x, y, x + tile, y + tile));
            }
        }
        tiles
    }

    fn size_cluster(&self, members: &[BoundingBox], use_grid: bool) -> Option<BoundingBox> {
        let tight = BoundingBox::enclosing(members)?;
        Some(if use_grid {
            region_from_grid(self.frame, &tight, self.min_region, &self.grid)
        } else {
            calculate_region(self.frame, &tight, self.min_region, REGION_MULTIPLIER)
        })
    }

    fn insert(
        &self,
        selected: &mut Vec<Selected>,
        mut members: Vec<BoundingBox>,
        mut source: RegionSource,
        mut use_grid: bool,
    ) {
        loop {
            let Some(tight) = BoundingBox::enclosing(&members) else {
                return;
            };
            if selected.iter().any(|s| s.region.bounds.contains(&tight)) {
                return;
            }
            let Some(bounds) = self.size_cluster(&members, use_grid) else {
                return;
            };
            match selected
                .iter()
                .position(|s| s.region.bounds.iou(&bounds) > REGION_DEDUP_IOU)
            {
                Some(index) => {
                    let existing = selected.swap_remove(index);
                    members.extend(existing.members);
                    source = source.min(existing.region.source);
                    use_grid = use_grid && existing.grid_sized;
                }
                None => {
                    selected.push(Selected {
                        region: DetectionRegion { bounds, source },
                        members,
                        grid_sized: use_grid,
                    });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> FrameShape {
        FrameShape::new(1280, 720)
    }

    #[test]
    fn region_grows_edge_and_stays_in_frame() {
        let b = BoundingBox::new(1200, 10, 1270, 300);
        let region = calculate_region(frame(), &b, 160, REGION_MULTIPLIER);
        // 290 * 1.35 = 391.5 -> 388
        assert_eq!(region.width(), 388);
        assert_eq!(region.width(), region.height());
        assert_eq!(region.x2, 1280);
        assert_eq!(region.y1, 0);
        assert!(region.contains(&b));
    }

    #[test]
    fn region_never_below_minimum() {
        let region = calculate_region(frame(), &BoundingBox::new(600, 300, 610, 320), 160, 1.35);
        assert_eq!(region.width(), 160);
        assert_eq!(region, BoundingBox::new(525, 230, 685, 390));
    }

    #[test]
    fn region_larger_than_frame_starts_at_origin() {
        let small = FrameShape::new(320, 180);
        let region = calculate_region(small, &BoundingBox::new(0, 0, 320, 180), 160, 1.35);
        assert_eq!(region.x1, 0);
        assert_eq!(region.y1, 0);
        assert_eq!(region.width(), 432);
    }

    #[test]
    fn boundary_of_small_box_uses_min_region() {
        let boundary = cluster_boundary(&BoundingBox::new(100, 100, 110, 110), 160);
        assert_eq!(boundary, BoundingBox::new(-49, -49, 259, 259));
    }

    #[test]
    fn near_boxes_cluster_far_boxes_do_not() {
        let boxes = [
            BoundingBox::new(100, 100, 120, 140),
            BoundingBox::new(130, 110, 150, 150),
            BoundingBox::new(1000, 500, 1020, 540),
        ];
        let clusters = cluster_boxes(&boxes, 160);
        assert_eq!(clusters, vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn clustering_is_transitive() {
        // 0 touches 1, 1 touches 2, 0 and 2 are apart.
        let boxes = [
            BoundingBox::new(0, 0, 10, 10),
            BoundingBox::new(280, 0, 290, 10),
            BoundingBox::new(560, 0, 570, 10),
        ];
        assert_eq!(cluster_boxes(&boxes, 160), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn motion_inside_tracked_region_adds_nothing() {
        let mut selector = RegionSelector::new(frame(), 160);
        selector.select(&[], &[], false);
        let tracked = [BoundingBox::new(600, 300, 650, 400)];
        let motion = [BoundingBox::new(610, 320, 640, 380)];
        let regions = selector.select(&tracked, &motion, true);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].source, RegionSource::Tracked);
    }

    #[test]
    fn motion_ignored_when_excluded() {
        let mut selector = RegionSelector::new(frame(), 160);
        selector.select(&[], &[], false);
        let motion = [BoundingBox::new(10, 10, 40, 40)];
        assert!(selector.select(&[], &motion, false).is_empty());
        assert_eq!(selector.select(&[], &motion, true).len(), 1);
    }

    #[test]
    fn overlapping_regions_merge_into_tracked_source() {
        let mut selector = RegionSelector::new(frame(), 160);
        selector.select(&[], &[], false);
        let tracked = [BoundingBox::new(400, 300, 440, 380)];
        // Sticks out of the tracked region; its own region would overlap it by 1/3.
        let motion = [BoundingBox::new(480, 300, 520, 380)];
        let regions = selector.select(&tracked, &motion, true);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].source, RegionSource::Tracked);
        assert!(regions[0].bounds.contains(&tracked[0]));
        assert!(regions[0].bounds.contains(&motion[0]));
    }

    #[test]
    fn startup_sweep_runs_once_and_covers_frame() {
        let mut selector = RegionSelector::new(frame(), 160);
        let first = selector.select(&[], &[], false);
        assert!(first.iter().all(|r| r.source == RegionSource::Startup));
        // 1280 / 320 = 4 columns, 720 -> 3 rows.
        assert_eq!(first.len(), 12);
        let covered: i64 = first
            .iter()
            .map(|r| r.bounds.intersection_area(&frame().bounds()))
            .sum();
        assert!(covered >= frame().bounds().area());
        assert!(selector.select(&[], &[], false).is_empty());
    }

    #[test]
    fn trailing_tile_pulled_flush_when_overlap_is_small() {
        assert_eq!(tile_offsets(1280, 320), vec![0, 320, 640, 960]);
        assert_eq!(tile_offsets(1250, 320), vec![0, 320, 640, 930]);
        assert_eq!(tile_offsets(1000, 320), vec![0, 320, 640, 960]);
        assert_eq!(tile_offsets(200, 320), vec![0]);
    }

    #[test]
    fn grid_enlarges_undersized_motion_region() {
        let frame = FrameShape::new(800, 800);
        let observed = vec![
            NormalizedBox {
                x: 200.0 / 800.0,
                y: 200.0 / 800.0,
                w: 300.0 / 800.0,
                h: 100.0 / 800.0,
            };
            4
        ];
        let grid = RegionGrid::from_observations(frame, &observed, 160);
        let cluster = BoundingBox::new(340, 240, 360, 260);
        let plain = calculate_region(frame, &cluster, 160, REGION_MULTIPLIER);
        let sized = region_from_grid(frame, &cluster, 160, &grid);
        assert_eq!(plain.width(), 160);
        assert_eq!(sized.width(), 404);
    }
}
