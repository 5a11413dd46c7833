//! Integer pixel-space boxes.
//!
//! Boxes are `(x1, y1, x2, y2)` with `x2 >= x1` and `y2 >= y1`, in full-frame
//! pixel coordinates at detect resolution.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> i64 {
        self.width().max(0) as i64 * self.height().max(0) as i64
    }

    /// Width over height, with height floored at 1.
    pub fn ratio(&self) -> f64 {
        self.width() as f64 / self.height().max(1) as f64
    }

    pub fn longest_edge(&self) -> i32 {
        self.width().max(self.height())
    }

    /// Integer centroid, truncated the same way for every caller.
    pub fn centroid(&self) -> (i32, i32) {
        (
            ((self.x1 + self.x2) as f64 / 2.0) as i32,
            ((self.y1 + self.y2) as f64 / 2.0) as i32,
        )
    }

    /// True when `other` lies entirely inside `self` (edges inclusive).
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.x1 <= other.x1 && self.y1 <= other.y1 && self.x2 >= other.x2 && self.y2 >= other.y2
    }

    /// True when the boxes share any area or touch.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.x1 > other.x2 || other.x1 > self.x2 || self.y1 > other.y2 || other.y1 > self.y2)
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> i64 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0) as i64;
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0) as i64;
        w * h
    }

    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let inter = self.intersection_area(other);
        if inter == 0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f64 / union as f64
    }

    /// Smallest box covering both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
            x2: self.x2.max(other.x2),
            y2: self.y2.max(other.y2),
        }
    }

    /// Tight bounding box of a non-empty set.
    pub fn enclosing<'a, I>(boxes: I) -> Option<BoundingBox>
    where
        I: IntoIterator<Item = &'a BoundingBox>,
    {
        boxes.into_iter().fold(None, |acc, b| match acc {
            None => Some(*b),
            Some(a) => Some(a.union(b)),
        })
    }
}

impl From<(i32, i32, i32, i32)> for BoundingBox {
    fn from((x1, y1, x2, y2): (i32, i32, i32, i32)) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

/// True when `b` is fully inside any of `regions`.
pub fn inside_any(b: &BoundingBox, regions: &[BoundingBox]) -> bool {
    regions.iter().any(|r| r.contains(b))
}

/// True when `b` intersects any of `others`.
pub fn intersects_any(b: &BoundingBox, others: &[BoundingBox]) -> bool {
    others.iter().any(|o| o.intersects(b))
}
