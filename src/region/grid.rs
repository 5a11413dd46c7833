//! Historical region-size grid.
//!
//! The frame is split into 8x8 cells. Each cell remembers the widths (as a
//! fraction of frame width) of regions that found objects centred in it, and
//! summarises them as mean and standard deviation. Motion-only clusters use
//! the cell statistics to pick a region size closer to what usually works.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use super::{calculate_region, REGION_MULTIPLIER};
use crate::frame::FrameShape;
use crate::geometry::BoundingBox;

pub const GRID_SIZE: usize = 8;

/// Observations kept per camera by `RegionGridStore`.
pub const MAX_GRID_OBSERVATIONS: usize = 2000;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GridCell {
    pub sizes: Vec<f64>,
    pub mean: f64,
    pub std_dev: f64,
}

impl GridCell {
    fn summarise(&mut self) {
        if self.sizes.is_empty() {
            return;
        }
        let n = self.sizes.len() as f64;
        let mean = self.sizes.iter().sum::<f64>() / n;
        let variance = self.sizes.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        self.mean = mean.clamp(0.0, 1.0);
        self.std_dev = variance.sqrt().clamp(0.0, 1.0);
    }
}

/// Box relative to the frame: origin and size all in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl NormalizedBox {
    pub fn from_box(b: &BoundingBox, frame: FrameShape) -> Self {
        let (fw, fh) = (frame.width.max(1) as f64, frame.height.max(1) as f64);
        Self {
            x: b.x1 as f64 / fw,
            y: b.y1 as f64 / fh,
            w: b.width() as f64 / fw,
            h: b.height() as f64 / fh,
        }
    }

    pub fn to_box(&self, frame: FrameShape) -> BoundingBox {
        let (fw, fh) = (frame.width as f64, frame.height as f64);
        BoundingBox::new(
            (self.x * fw) as i32,
            (self.y * fh) as i32,
            ((self.x + self.w) * fw) as i32,
            ((self.y + self.h) * fh) as i32,
        )
    }
}

/// `cells[x][y]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionGrid {
    cells: Vec<Vec<GridCell>>,
}

impl Default for RegionGrid {
    fn default() -> Self {
        Self {
            cells: vec![vec![GridCell::default(); GRID_SIZE]; GRID_SIZE],
        }
    }
}

impl RegionGrid {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Learn a grid from boxes of previously tracked objects.
    pub fn from_observations(frame: FrameShape, boxes: &[NormalizedBox], min_region: i32) -> Self {
        let mut grid = Self::default();
        for observed in boxes {
            let b = observed.to_box(frame);
            if b.width() <= 0 || b.height() <= 0 {
                continue;
            }
            let region = calculate_region(frame, &b, min_region, REGION_MULTIPLIER);
            let (gx, gy) = grid.cell_index(frame, b.centroid());
            grid.cells[gx][gy]
                .sizes
                .push(region.width() as f64 / frame.width.max(1) as f64);
        }
        for column in grid.cells.iter_mut() {
            for cell in column.iter_mut() {
                cell.summarise();
            }
        }
        grid
    }

    pub fn is_empty(&self) -> bool {
        self.cells.iter().flatten().all(|cell| cell.sizes.is_empty())
    }

    pub fn cell(&self, x: usize, y: usize) -> Option<&GridCell> {
        self.cells.get(x).and_then(|column| column.get(y))
    }

    /// Cell under a pixel position.
    pub fn cell_at(&self, frame: FrameShape, point: (i32, i32)) -> &GridCell {
        let (gx, gy) = self.cell_index(frame, point);
        &self.cells[gx][gy]
    }

    fn cell_index(&self, frame: FrameShape, (x, y): (i32, i32)) -> (usize, usize) {
        let cell_w = frame.width.max(1) as f64 / GRID_SIZE as f64;
        let cell_h = frame.height.max(1) as f64 / GRID_SIZE as f64;
        let gx = ((x.max(0) as f64 / cell_w) as usize).min(GRID_SIZE - 1);
        let gy = ((y.max(0) as f64 / cell_h) as usize).min(GRID_SIZE - 1);
        (gx, gy)
    }
}

// ----------------------------------------------------------------------------
// Grid source
// ----------------------------------------------------------------------------

/// Supplies refreshed region grids by camera name.
pub trait RegionGridSource: Send + Sync {
    /// `None` when no grid is available; callers keep their previous grid.
    fn region_grid(&self, camera: &str) -> Option<RegionGrid>;
}

struct CameraObservations {
    frame: FrameShape,
    min_region: i32,
    boxes: VecDeque<NormalizedBox>,
}

/// In-process grid source fed with boxes of tracked objects.
#[derive(Default)]
pub struct RegionGridStore {
    cameras: Mutex<HashMap<String, CameraObservations>>,
}

impl RegionGridStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_camera(&self, camera: &str, frame: FrameShape, min_region: i32) {
        let mut cameras = self.cameras.lock().unwrap_or_else(|e| e.into_inner());
        cameras
            .entry(camera.to_string())
            .or_insert_with(|| CameraObservations {
                frame,
                min_region,
                boxes: VecDeque::new(),
            });
    }

    /// Record the box of a tracked object. Unknown cameras are ignored.
    pub fn observe(&self, camera: &str, b: &BoundingBox) {
        let mut cameras = self.cameras.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(observations) = cameras.get_mut(camera) {
            let normalized = NormalizedBox::from_box(b, observations.frame);
            observations.boxes.push_back(normalized);
            while observations.boxes.len() > MAX_GRID_OBSERVATIONS {
                observations.boxes.pop_front();
            }
        }
    }

    pub fn observation_count(&self, camera: &str) -> usize {
        let cameras = self.cameras.lock().unwrap_or_else(|e| e.into_inner());
        cameras.get(camera).map_or(0, |o| o.boxes.len())
    }
}

impl RegionGridSource for RegionGridStore {
    fn region_grid(&self, camera: &str) -> Option<RegionGrid> {
        let cameras = self.cameras.lock().unwrap_or_else(|e| e.into_inner());
        let observations = cameras.get(camera)?;
        if observations.boxes.is_empty() {
            return None;
        }
        let boxes: Vec<NormalizedBox> = observations.boxes.iter().copied().collect();
        Some(RegionGrid::from_observations(
            observations.frame,
            &boxes,
            observations.min_region,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observations_fill_the_centroid_cell() {
        let frame = FrameShape::new(800, 800);
        // 40px person centred at (250, 250) -> cell (2, 2).
        let boxes = vec![
            NormalizedBox { x: 230.0 / 800.0, y: 230.0 / 800.0, w: 40.0 / 800.0, h: 40.0 / 800.0 };
            3
        ];
        let grid = RegionGrid::from_observations(frame, &boxes, 160);
        let cell = grid.cell(2, 2).unwrap();
        assert_eq!(cell.sizes.len(), 3);
        assert!((cell.mean - 0.2).abs() < 1e-9);
        assert_eq!(cell.std_dev, 0.0);
        assert!(grid.cell(0, 0).unwrap().sizes.is_empty());
        assert!(!grid.is_empty());
    }

    #[test]
    fn store_builds_grid_per_camera() {
        let store = RegionGridStore::new();
        assert!(store.region_grid("yard").is_none());
        store.register_camera("yard", FrameShape::new(640, 480), 160);
        store.observe("nowhere", &BoundingBox::new(0, 0, 10, 10));
        assert!(store.region_grid("yard").is_none());

        store.observe("yard", &BoundingBox::new(300, 200, 340, 280));
        assert_eq!(store.observation_count("yard"), 1);
        let grid = store.region_grid("yard").unwrap();
        assert!(!grid.is_empty());
    }
}
