use anyhow::Result;
use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::detect::backend::{
    empty_detections, DetectorBackend, ModelInput, RawDetections, MAX_DETECTIONS,
};

/// Luma above which a pixel belongs to a blob.
pub const BRIGHT_THRESHOLD: u8 = 200;
/// Blobs with fewer pixels are ignored.
pub const MIN_BLOB_PIXELS: u32 = 4;

/// Reference CPU backend: every bright blob is reported as label 0.
///
/// Score grows with how much of its bounding box the blob fills, so solid
/// rectangles score near 0.95 and thin diagonal streaks stay low.
#[derive(Default)]
pub struct CpuBackend {
    mask: GrayImage,
}

#[derive(Clone, Copy)]
struct Blob {
    x1: u32,
    y1: u32,
    x2: u32,
    y2: u32,
    pixels: u32,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn threshold(&mut self, input: &ModelInput<'_>) {
        if self.mask.width() != input.width || self.mask.height() != input.height {
            self.mask = GrayImage::new(input.width, input.height);
        }
        for y in 0..input.height {
            for x in 0..input.width {
                let [r, g, b] = input.rgb(x as usize, y as usize);
                let luma = (r as u32 * 299 + g as u32 * 587 + b as u32 * 114) / 1000;
                let value = if luma > BRIGHT_THRESHOLD as u32 { 255 } else { 0 };
                self.mask.put_pixel(x, y, Luma([value]));
            }
        }
    }
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect_raw(&mut self, input: &ModelInput<'_>) -> Result<RawDetections> {
        self.threshold(input);
        let labels = connected_components(&self.mask, Connectivity::Eight, Luma([0u8]));

        let mut blobs: Vec<Option<Blob>> = Vec::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let id = label.0[0] as usize;
            if id == 0 {
                continue;
            }
            if blobs.len() <= id {
                blobs.resize(id + 1, None);
            }
            let blob = blobs[id].get_or_insert(Blob {
                x1: x,
                y1: y,
                x2: x,
                y2: y,
                pixels: 0,
            });
            blob.x1 = blob.x1.min(x);
            blob.y1 = blob.y1.min(y);
            blob.x2 = blob.x2.max(x);
            blob.y2 = blob.y2.max(y);
            blob.pixels += 1;
        }

        let (w, h) = (input.width as f32, input.height as f32);
        let mut found: Vec<[f32; 6]> = blobs
            .into_iter()
            .flatten()
            .filter(|blob| blob.pixels >= MIN_BLOB_PIXELS)
            .map(|blob| {
                let box_area = (blob.x2 - blob.x1 + 1) * (blob.y2 - blob.y1 + 1);
                let fill = blob.pixels as f32 / box_area as f32;
                [
                    0.0,
                    0.5 + 0.45 * fill,
                    blob.y1 as f32 / h,
                    blob.x1 as f32 / w,
                    (blob.y2 + 1) as f32 / h,
                    (blob.x2 + 1) as f32 / w,
                ]
            })
            .collect();
        found.sort_by(|a, b| b[1].total_cmp(&a[1]));

        let mut table = empty_detections();
        for (row, detection) in table.iter_mut().zip(found.into_iter().take(MAX_DETECTIONS)) {
            *row = detection;
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InputTensor;

    fn input_with_square(size: u32, x: u32, y: u32, side: u32) -> Vec<u8> {
        let mut data = vec![0u8; (size * size * 3) as usize];
        for py in y..y + side {
            for px in x..x + side {
                let i = ((py * size + px) * 3) as usize;
                data[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        data
    }

    #[test]
    fn reports_bright_square_normalised() {
        let data = input_with_square(100, 20, 40, 10);
        let input = ModelInput { data: &data, width: 100, height: 100, layout: InputTensor::Nhwc };
        let table = CpuBackend::new().detect_raw(&input).unwrap();
        let row = table[0];
        assert_eq!(row[0], 0.0);
        assert!((row[1] - 0.95).abs() < 1e-6);
        assert!((row[2] - 0.40).abs() < 1e-6);
        assert!((row[3] - 0.20).abs() < 1e-6);
        assert!((row[4] - 0.50).abs() < 1e-6);
        assert!((row[5] - 0.30).abs() < 1e-6);
        assert_eq!(table[1][1], 0.0);
    }

    #[test]
    fn dark_input_detects_nothing() {
        let data = vec![10u8; 64 * 64 * 3];
        let input = ModelInput { data: &data, width: 64, height: 64, layout: InputTensor::Nhwc };
        let table = CpuBackend::new().detect_raw(&input).unwrap();
        assert!(table.iter().all(|row| row[1] == 0.0));
    }
}
