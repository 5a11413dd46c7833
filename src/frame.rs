//! Raw frame layout and frame bookkeeping.
//!
//! - `FrameShape`: geometry of a planar YUV 4:2:0 (I420) frame at detect resolution.
//! - `frame_name`: the arena name contract, `"{camera}{frame_time}"`.
//! - `FrameRing`: bounded ring of recently created frame names. Evicted names are
//!   handed back so the producer can delete their segments, bounding shm usage.
//! - Tensor helpers: crop a square region out of a YUV frame into RGB and resize
//!   it to the model input.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::collections::VecDeque;

use crate::geometry::BoundingBox;

/// Default number of frames a camera may keep alive in shared memory.
pub const DEFAULT_SHM_FRAME_COUNT: usize = 50;

/// Dimensions of a YUV 4:2:0 frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
}

impl FrameShape {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Bytes in the luma plane.
    pub fn luma_size(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Bytes in one complete I420 frame (`height * 3 / 2` rows of `width`).
    pub fn yuv_size(&self) -> usize {
        self.luma_size() * 3 / 2
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(0, 0, self.width as i32, self.height as i32)
    }
}

/// Shared-memory name of a camera frame.
pub fn frame_name(camera: &str, frame_time: f64) -> String {
    format!("{}{}", camera, frame_time)
}

/// Luma plane of an I420 frame.
pub fn luma_plane<'a>(frame: &'a [u8], shape: &FrameShape) -> Result<&'a [u8]> {
    frame.get(..shape.luma_size()).ok_or_else(|| {
        anyhow!(
            "frame holds {} bytes, luma plane needs {}",
            frame.len(),
            shape.luma_size()
        )
    })
}

// ----------------------------------------------------------------------------
// FrameRing: bounded set of live frame names
// ----------------------------------------------------------------------------

/// Bounded ring of frame names created by one producer.
///
/// - Keeps the last `capacity` names
/// - Returns evicted names from `push` so the caller can delete them
pub struct FrameRing {
    names: VecDeque<String>,
    capacity: usize,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            names: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a newly created frame. Returns the names pushed out of the ring.
    pub fn push(&mut self, name: String) -> Vec<String> {
        self.names.push_back(name);
        let mut evicted = Vec::new();
        while self.names.len() > self.capacity {
            if let Some(old) = self.names.pop_front() {
                evicted.push(old);
            }
        }
        evicted
    }

    /// Forget a name that was already deleted (e.g. a dropped frame).
    pub fn forget(&mut self, name: &str) {
        self.names.retain(|n| n != name);
    }

    pub fn latest(&self) -> Option<&str> {
        self.names.back().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Remove and return every tracked name.
    pub fn drain(&mut self) -> impl Iterator<Item = String> + '_ {
        self.names.drain(..)
    }
}

// ----------------------------------------------------------------------------
// Tensor input
// ----------------------------------------------------------------------------

/// Crop `region` from an I420 frame into an RGB image.
///
/// Parts of the region outside the frame are filled with black.
pub fn yuv_region_to_rgb(frame: &[u8], shape: &FrameShape, region: &BoundingBox) -> Result<RgbImage> {
    if frame.len() < shape.yuv_size() {
        return Err(anyhow!(
            "YUV frame length mismatch: expected {}, got {}",
            shape.yuv_size(),
            frame.len()
        ));
    }
    let out_w = region.width();
    let out_h = region.height();
    if out_w <= 0 || out_h <= 0 {
        return Err(anyhow!("region {:?} is empty", region));
    }

    let w = shape.width as usize;
    let h = shape.height as usize;
    let y_plane = w * h;
    let chroma_w = w / 2;
    let chroma_plane = chroma_w * (h / 2);

    let mut rgb = RgbImage::new(out_w as u32, out_h as u32);
    for (ox, oy, pixel) in rgb.enumerate_pixels_mut() {
        let fx = region.x1 + ox as i32;
        let fy = region.y1 + oy as i32;
        if fx < 0 || fy < 0 || fx as usize >= w || fy as usize >= h {
            continue;
        }
        let (fx, fy) = (fx as usize, fy as usize);
        let chroma_index = (fy / 2) * chroma_w + (fx / 2).min(chroma_w.saturating_sub(1));
        let y = frame[fy * w + fx] as f32;
        let u = frame[y_plane + chroma_index] as f32 - 128.0;
        let v = frame[y_plane + chroma_plane + chroma_index] as f32 - 128.0;

        let r = y + 1.402_f32 * v;
        let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
        let b = y + 1.772_f32 * u;
        pixel.0 = [clamp_u8(r), clamp_u8(g), clamp_u8(b)];
    }
    Ok(rgb)
}

/// Build an HWC RGB tensor of `model_width x model_height` for one region.
pub fn create_tensor_input(
    frame: &[u8],
    shape: &FrameShape,
    region: &BoundingBox,
    model_width: u32,
    model_height: u32,
) -> Result<Vec<u8>> {
    let cropped = yuv_region_to_rgb(frame, shape, region)?;
    let resized = if cropped.width() == model_width && cropped.height() == model_height {
        cropped
    } else {
        imageops::resize(&cropped, model_width, model_height, FilterType::Triangle)
    };
    Ok(resized.into_raw())
}

fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(shape: &FrameShape, luma: u8) -> Vec<u8> {
        let mut frame = vec![128u8; shape.yuv_size()];
        frame[..shape.luma_size()].fill(luma);
        frame
    }

    #[test]
    fn yuv_size_is_one_and_a_half_planes() {
        let shape = FrameShape::new(640, 480);
        assert_eq!(shape.luma_size(), 307_200);
        assert_eq!(shape.yuv_size(), 460_800);
    }

    #[test]
    fn frame_name_concatenates_camera_and_time() {
        assert_eq!(frame_name("front", 1700000000.5), "front1700000000.5");
    }

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let mut ring = FrameRing::new(3);
        for i in 0..3 {
            assert!(ring.push(format!("f{}", i)).is_empty());
        }
        assert_eq!(ring.push("f3".to_string()), vec!["f0".to_string()]);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.latest(), Some("f3"));

        ring.forget("f2");
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.drain().count(), 2);
        assert!(ring.is_empty());
    }

    #[test]
    fn gray_yuv_converts_to_gray_rgb() -> Result<()> {
        let shape = FrameShape::new(8, 8);
        let frame = gray_frame(&shape, 90);
        let rgb = yuv_region_to_rgb(&frame, &shape, &BoundingBox::new(0, 0, 4, 4))?;
        assert!(rgb.pixels().all(|p| p.0 == [90, 90, 90]));
        Ok(())
    }

    #[test]
    fn region_outside_frame_is_padded_black() -> Result<()> {
        let shape = FrameShape::new(8, 8);
        let frame = gray_frame(&shape, 200);
        let rgb = yuv_region_to_rgb(&frame, &shape, &BoundingBox::new(4, 4, 12, 12))?;
        assert_eq!(rgb.get_pixel(0, 0).0, [200, 200, 200]);
        assert_eq!(rgb.get_pixel(7, 7).0, [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn tensor_is_resized_to_model_input() -> Result<()> {
        let shape = FrameShape::new(64, 48);
        let frame = gray_frame(&shape, 50);
        let tensor = create_tensor_input(&frame, &shape, &BoundingBox::new(0, 0, 32, 32), 16, 16)?;
        assert_eq!(tensor.len(), 16 * 16 * 3);
        Ok(())
    }
}
