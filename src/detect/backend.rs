use anyhow::{anyhow, Result};

use crate::config::{DetectorConfig, DetectorKind, InputTensor, ModelConfig};

use super::backends::{CpuBackend, StubBackend};
#[cfg(feature = "backend-tract")]
use super::backends::TractBackend;

/// Rows in one detector output table.
pub const MAX_DETECTIONS: usize = 20;
/// Columns per row: label index, score, y1, x1, y2, x2.
pub const DETECTION_FIELDS: usize = 6;
/// Bytes of one output table in shared memory.
pub const RAW_DETECTIONS_BYTES: usize = MAX_DETECTIONS * DETECTION_FIELDS * 4;

/// Fixed-size detector output. Coordinates are normalised to the region.
/// Rows are score-descending; a row scoring 0 ends the list.
pub type RawDetections = [[f32; DETECTION_FIELDS]; MAX_DETECTIONS];

pub fn empty_detections() -> RawDetections {
    [[0.0; DETECTION_FIELDS]; MAX_DETECTIONS]
}

/// Serialise a table into `out` (native endian f32).
pub fn write_detections(table: &RawDetections, out: &mut [u8]) -> Result<()> {
    if out.len() < RAW_DETECTIONS_BYTES {
        return Err(anyhow!(
            "detection buffer holds {} bytes, need {}",
            out.len(),
            RAW_DETECTIONS_BYTES
        ));
    }
    for (chunk, value) in out.chunks_exact_mut(4).zip(table.iter().flatten()) {
        chunk.copy_from_slice(&value.to_ne_bytes());
    }
    Ok(())
}

pub fn read_detections(bytes: &[u8]) -> Result<RawDetections> {
    if bytes.len() < RAW_DETECTIONS_BYTES {
        return Err(anyhow!(
            "detection buffer holds {} bytes, need {}",
            bytes.len(),
            RAW_DETECTIONS_BYTES
        ));
    }
    let mut table = empty_detections();
    for (value, chunk) in table.iter_mut().flatten().zip(bytes.chunks_exact(4)) {
        *value = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(table)
}

/// Borrowed model input tensor (u8 RGB).
#[derive(Clone, Copy, Debug)]
pub struct ModelInput<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub layout: InputTensor,
}

impl ModelInput<'_> {
    /// RGB of one pixel regardless of layout.
    pub fn rgb(&self, x: usize, y: usize) -> [u8; 3] {
        let (w, h) = (self.width as usize, self.height as usize);
        match self.layout {
            InputTensor::Nhwc => {
                let i = (y * w + x) * 3;
                [self.data[i], self.data[i + 1], self.data[i + 2]]
            }
            InputTensor::Nchw => {
                let plane = w * h;
                let i = y * w + x;
                [self.data[i], self.data[plane + i], self.data[2 * plane + i]]
            }
        }
    }
}

/// Detector backend trait.
///
/// Backends receive a model-sized tensor and return the fixed output table.
/// They never see frames, regions or labels.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run inference on one tensor.
    fn detect_raw(&mut self, input: &ModelInput<'_>) -> Result<RawDetections>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The closed set of detectors, selected once from config.
pub enum ObjectDetector {
    Cpu(CpuBackend),
    Stub(StubBackend),
    #[cfg(feature = "backend-tract")]
    Tract(TractBackend),
}

/// A detector bound to its model input contract.
pub struct ModelDetector {
    detector: ObjectDetector,
    model: ModelConfig,
    scratch: Vec<u8>,
}

impl ObjectDetector {
    pub fn from_config(detector: &DetectorConfig, model: &ModelConfig) -> Result<Self> {
        match detector.kind {
            DetectorKind::Cpu => Ok(Self::Cpu(CpuBackend::new())),
            DetectorKind::Stub => Ok(Self::Stub(StubBackend::new())),
            #[cfg(feature = "backend-tract")]
            DetectorKind::Tract => {
                let path = detector.model_path.as_ref().ok_or_else(|| {
                    anyhow!("detector {} of type tract needs model_path", detector.name)
                })?;
                Ok(Self::Tract(TractBackend::new(path, model)?))
            }
            #[cfg(not(feature = "backend-tract"))]
            DetectorKind::Tract => {
                let _ = model;
                Err(anyhow!(
                    "detector {} uses type tract but this build lacks the backend-tract feature",
                    detector.name
                ))
            }
        }
    }

    fn backend_mut(&mut self) -> &mut dyn DetectorBackend {
        match self {
            Self::Cpu(backend) => backend,
            Self::Stub(backend) => backend,
            #[cfg(feature = "backend-tract")]
            Self::Tract(backend) => backend,
        }
    }

    pub fn name(&mut self) -> &'static str {
        self.backend_mut().name()
    }
}

impl ModelDetector {
    pub fn new(detector: ObjectDetector, model: ModelConfig) -> Self {
        Self {
            detector,
            model,
            scratch: Vec::new(),
        }
    }

    pub fn from_config(detector: &DetectorConfig, model: &ModelConfig) -> Result<Self> {
        let mut built = Self::new(ObjectDetector::from_config(detector, model)?, model.clone());
        built.detector.backend_mut().warm_up()?;
        Ok(built)
    }

    pub fn name(&mut self) -> &'static str {
        self.detector.name()
    }

    /// Run inference on an HWC RGB tensor of the model size, transposing to
    /// NCHW first when the model wants it.
    pub fn detect_raw(&mut self, tensor: &[u8]) -> Result<RawDetections> {
        let expected = self.model.tensor_size();
        if tensor.len() < expected {
            return Err(anyhow!(
                "tensor holds {} bytes, model needs {}",
                tensor.len(),
                expected
            ));
        }
        let tensor = &tensor[..expected];
        let data = match self.model.input_tensor {
            InputTensor::Nhwc => tensor,
            InputTensor::Nchw => {
                hwc_to_chw(tensor, &mut self.scratch);
                &self.scratch[..]
            }
        };
        let input = ModelInput {
            data,
            width: self.model.width,
            height: self.model.height,
            layout: self.model.input_tensor,
        };
        self.detector.backend_mut().detect_raw(&input)
    }
}

fn hwc_to_chw(hwc: &[u8], out: &mut Vec<u8>) {
    let plane = hwc.len() / 3;
    out.clear();
    out.resize(hwc.len(), 0);
    for (i, pixel) in hwc.chunks_exact(3).enumerate() {
        out[i] = pixel[0];
        out[plane + i] = pixel[1];
        out[2 * plane + i] = pixel[2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_table_survives_byte_encoding() {
        let mut table = empty_detections();
        table[0] = [1.0, 0.9, 0.1, 0.2, 0.3, 0.4];
        let mut bytes = vec![0u8; RAW_DETECTIONS_BYTES];
        write_detections(&table, &mut bytes).unwrap();
        assert_eq!(read_detections(&bytes).unwrap(), table);
        assert!(read_detections(&bytes[..10]).is_err());
    }

    #[test]
    fn chw_input_reads_same_pixels() {
        let hwc: Vec<u8> = (0..12).collect(); // 2x2 RGB
        let mut chw = Vec::new();
        hwc_to_chw(&hwc, &mut chw);
        assert_eq!(chw, vec![0, 3, 6, 9, 1, 4, 7, 10, 2, 5, 8, 11]);
        let a = ModelInput { data: &hwc, width: 2, height: 2, layout: InputTensor::Nhwc };
        let b = ModelInput { data: &chw, width: 2, height: 2, layout: InputTensor::Nchw };
        assert_eq!(a.rgb(1, 1), b.rgb(1, 1));
    }

    #[test]
    fn tract_without_feature_is_fatal() {
        let detector = DetectorConfig {
            name: "onnx".to_string(),
            kind: DetectorKind::Tract,
            model_path: None,
        };
        assert!(ObjectDetector::from_config(&detector, &ModelConfig::default()).is_err());
    }
}
