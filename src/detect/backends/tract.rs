#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::config::{InputTensor, ModelConfig};
use crate::detect::backend::{
    empty_detections, DetectorBackend, ModelInput, RawDetections, DETECTION_FIELDS, MAX_DETECTIONS,
};

/// ONNX inference through tract.
///
/// The model must take one `u8`-derived f32 image (scaled to `[0, 1]`) and
/// produce a `[.., N, 6]` table whose rows already follow the
/// `label, score, y1, x1, y2, x2` layout, sorted by score.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
    layout: InputTensor,
}

impl TractBackend {
    pub fn new<P: AsRef<Path>>(model_path: P, model: &ModelConfig) -> Result<Self> {
        let model_path = model_path.as_ref();
        let (w, h) = (model.width as usize, model.height as usize);
        let shape = match model.input_tensor {
            InputTensor::Nhwc => tvec!(1, h, w, 3),
            InputTensor::Nchw => tvec!(1, 3, h, w),
        };
        let runnable = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), shape))
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model: runnable,
            width: model.width,
            height: model.height,
            layout: model.input_tensor,
        })
    }

    fn build_input(&self, input: &ModelInput<'_>) -> Result<Tensor> {
        if input.width != self.width || input.height != self.height {
            return Err(anyhow!(
                "tensor size {}x{} does not match model input {}x{}",
                input.width,
                input.height,
                self.width,
                self.height
            ));
        }
        let (w, h) = (self.width as usize, self.height as usize);
        let tensor = match self.layout {
            InputTensor::Nhwc => {
                tract_ndarray::Array4::from_shape_fn((1, h, w, 3), |(_, y, x, c)| {
                    input.rgb(x, y)[c] as f32 / 255.0
                })
                .into_tensor()
            }
            InputTensor::Nchw => {
                tract_ndarray::Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
                    input.rgb(x, y)[c] as f32 / 255.0
                })
                .into_tensor()
            }
        };
        Ok(tensor)
    }

    fn extract_rows(&self, outputs: TVec<TValue>) -> Result<RawDetections> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let values = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = values.shape();
        if shape.last().copied() != Some(DETECTION_FIELDS) {
            return Err(anyhow!(
                "model output shape {:?} does not end in {}",
                shape,
                DETECTION_FIELDS
            ));
        }
        let mut table = empty_detections();
        let flat: Vec<f32> = values.iter().copied().collect();
        for (row, chunk) in table
            .iter_mut()
            .zip(flat.chunks_exact(DETECTION_FIELDS))
            .take(MAX_DETECTIONS)
        {
            row.copy_from_slice(chunk);
        }
        Ok(table)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect_raw(&mut self, input: &ModelInput<'_>) -> Result<RawDetections> {
        let tensor = self.build_input(input)?;
        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .context("ONNX inference failed")?;
        self.extract_rows(outputs)
    }
}
