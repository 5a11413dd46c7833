//! Motion exclusion masks.
//!
//! Polygons are written as `"x1,y1,x2,y2,..."` in detect-resolution pixels.
//! They are rasterised at detect resolution, then shrunk to the motion frame;
//! any motion pixel that lands fully inside a polygon is excluded.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;

use crate::frame::FrameShape;

/// Parse one `"x1,y1,x2,y2,..."` polygon.
pub fn parse_polygon(polygon: &str) -> Result<Vec<Point<i32>>> {
    let values = polygon
        .split(',')
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse::<f64>()
                .map(|f| f.round() as i32)
                .map_err(|_| anyhow!("invalid mask coordinate {:?} in {:?}", v, polygon))
        })
        .collect::<Result<Vec<_>>>()?;
    if values.len() % 2 != 0 {
        return Err(anyhow!("mask {:?} has an odd number of coordinates", polygon));
    }
    let mut points: Vec<Point<i32>> = values
        .chunks_exact(2)
        .map(|xy| Point::new(xy[0], xy[1]))
        .collect();
    points.dedup();
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    if points.len() < 3 {
        return Err(anyhow!("mask {:?} needs at least three distinct points", polygon));
    }
    Ok(points)
}

/// Per-pixel exclusion map at `motion_width x motion_height` (row major,
/// `true` = masked), or `None` when nothing is masked.
pub fn motion_mask(
    polygons: &[String],
    detect: FrameShape,
    motion_width: u32,
    motion_height: u32,
) -> Result<Option<Vec<bool>>> {
    if polygons.is_empty() {
        return Ok(None);
    }
    let mut full = GrayImage::from_pixel(detect.width, detect.height, Luma([255u8]));
    for polygon in polygons {
        let points = parse_polygon(polygon)?;
        draw_polygon_mut(&mut full, &points, Luma([0u8]));
    }
    let small = imageops::resize(&full, motion_width, motion_height, FilterType::Triangle);
    Ok(Some(small.pixels().map(|p| p.0[0] == 0).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_opens_closed_polygons() {
        let points = parse_polygon("0,0, 10,0, 10,10, 0,10, 0,0").unwrap();
        assert_eq!(points.len(), 4);
        assert!(parse_polygon("0,0,10").is_err());
        assert!(parse_polygon("0,0,10,10").is_err());
        assert!(parse_polygon("a,b,c,d,e,f").is_err());
    }

    #[test]
    fn mask_covers_polygon_interior_only() {
        let mask = motion_mask(
            &["0,0,99,0,99,99,0,99".to_string()],
            FrameShape::new(200, 100),
            40,
            20,
        )
        .unwrap()
        .unwrap();
        assert_eq!(mask.len(), 40 * 20);
        // Left half masked, right half clear.
        assert!(mask[10 * 40 + 5]);
        assert!(!mask[10 * 40 + 35]);
    }

    #[test]
    fn no_polygons_means_no_mask() {
        assert!(motion_mask(&[], FrameShape::new(8, 8), 4, 4).unwrap().is_none());
    }
}
