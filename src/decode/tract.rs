#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use super::proposal::{postprocess, preprocess, ProposalSettings, RegionProposer};
use crate::frame::Frame;
use crate::geometry::Region;

/// Tract-based ONNX runner for the QR region model.
///
/// Loads a local model file once; inference does no I/O.
pub struct TractProposer {
    model: TypedSimplePlan<TypedModel>,
    settings: ProposalSettings,
}

impl TractProposer {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, settings: ProposalSettings) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = settings.input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, settings })
    }
}

impl RegionProposer for TractProposer {
    fn propose(&self, frame: &Frame) -> Result<Vec<Region>> {
        let side = self.settings.input_size as usize;
        let input = preprocess(frame, self.settings.input_size)?;
        let input = tract_ndarray::Array4::from_shape_vec((1, 3, side, side), input)
            .context("input tensor shape")?
            .into_tensor();

        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;

        let shape = view.shape();
        if shape.len() != 3 || shape[0] != 1 {
            return Err(anyhow!("unexpected output shape {:?}", shape));
        }
        let (dims, anchors) = (shape[1], shape[2]);
        let flat: Vec<f32> = view.iter().copied().collect();

        postprocess(&flat, dims, anchors, frame.width, frame.height, &self.settings)
    }
}
