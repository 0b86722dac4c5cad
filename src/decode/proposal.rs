//! Region proposals from a YOLOv8-style single-class detector.
//!
//! The model sees a square `input_size` resize of the frame as one RGB image
//! with three planes scaled to [0,1]. Its output is `[1, dims, anchors]`:
//! rows 0..4 are cx, cy, w, h in model-input pixels, rows 4.. are class
//! scores. Pre- and post-processing are pure functions so they can be
//! exercised without a model.

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use std::path::Path;

use crate::frame::Frame;
use crate::geometry::Region;

pub const DEFAULT_INPUT_SIZE: u32 = 640;
pub const DEFAULT_CONFIDENCE: f32 = 0.45;
pub const DEFAULT_IOU: f32 = 0.45;

/// Proposes crops likely to contain a code. Stateless across frames.
pub trait RegionProposer: Send + Sync {
    fn propose(&self, frame: &Frame) -> Result<Vec<Region>>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProposalSettings {
    pub input_size: u32,
    pub confidence: f32,
    pub iou: f32,
}

impl Default for ProposalSettings {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            confidence: DEFAULT_CONFIDENCE,
            iou: DEFAULT_IOU,
        }
    }
}

/// Box in original-frame pixels, before clipping.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProposalBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub score: f32,
}

impl ProposalBox {
    fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    pub fn iou(&self, other: &ProposalBox) -> f32 {
        let l = self.x.max(other.x);
        let r = (self.x + self.w).min(other.x + other.w);
        let t = self.y.max(other.y);
        let b = (self.y + self.h).min(other.y + other.h);
        let inter = (r - l).max(0.0) * (b - t).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Integer rectangle inside `width` x `height`, or `None` when nothing
    /// of the box lies inside the image.
    pub fn clip(&self, width: u32, height: u32) -> Option<Region> {
        let x0 = self.x.max(0.0).min(width as f32);
        let y0 = self.y.max(0.0).min(height as f32);
        let x1 = (self.x + self.w).max(0.0).min(width as f32);
        let y1 = (self.y + self.h).max(0.0).min(height as f32);
        let (x0, y0) = (x0.floor() as u32, y0.floor() as u32);
        let (x1, y1) = (x1.ceil() as u32, y1.ceil() as u32);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Region {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }
}

/// Square resize, RGB order, [0,1] scaling, planar CHW layout.
pub fn preprocess(frame: &Frame, input_size: u32) -> Result<Vec<f32>> {
    let view = frame
        .rgb_view()
        .ok_or_else(|| anyhow!("frame buffer does not match its dimensions"))?;
    let resized = image::imageops::resize(&view, input_size, input_size, FilterType::Triangle);

    let plane = (input_size * input_size) as usize;
    let mut tensor = vec![0f32; plane * 3];
    for (i, px) in resized.pixels().enumerate() {
        tensor[i] = px[0] as f32 / 255.0;
        tensor[i + plane] = px[1] as f32 / 255.0;
        tensor[i + 2 * plane] = px[2] as f32 / 255.0;
    }
    Ok(tensor)
}

/// Greedy NMS: keep the highest score, drop anything overlapping it by more
/// than `iou_threshold`, repeat.
pub fn non_max_suppression(boxes: &mut Vec<ProposalBox>, iou_threshold: f32) {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept = 0;
    for index in 0..boxes.len() {
        let overlaps = (0..kept).any(|prev| boxes[prev].iou(&boxes[index]) > iou_threshold);
        if !overlaps {
            boxes.swap(kept, index);
            kept += 1;
        }
    }
    boxes.truncate(kept);
}

/// Decode raw model output into clipped frame-space regions, best first.
pub fn postprocess(
    output: &[f32],
    dims: usize,
    anchors: usize,
    frame_width: u32,
    frame_height: u32,
    settings: &ProposalSettings,
) -> Result<Vec<Region>> {
    if dims < 5 {
        return Err(anyhow!("expected at least 5 output rows, model gave {}", dims));
    }
    if output.len() < dims * anchors {
        return Err(anyhow!(
            "output holds {} values, expected {}x{}",
            output.len(),
            dims,
            anchors
        ));
    }

    let at = |row: usize, anchor: usize| output[row * anchors + anchor];
    let x_factor = frame_width as f32 / settings.input_size as f32;
    let y_factor = frame_height as f32 / settings.input_size as f32;

    let mut boxes = Vec::new();
    for anchor in 0..anchors {
        let score = (4..dims).map(|row| at(row, anchor)).fold(0.0f32, f32::max);
        if score < settings.confidence {
            continue;
        }
        let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
        boxes.push(ProposalBox {
            x: (cx - w / 2.0) * x_factor,
            y: (cy - h / 2.0) * y_factor,
            w: w * x_factor,
            h: h * y_factor,
            score,
        });
    }

    non_max_suppression(&mut boxes, settings.iou);
    Ok(boxes
        .iter()
        .filter_map(|b| b.clip(frame_width, frame_height))
        .collect())
}

/// Build the configured proposer, if any.
#[cfg(feature = "backend-tract")]
pub fn load_proposer(
    model_path: Option<&Path>,
    settings: ProposalSettings,
) -> Result<Option<Box<dyn RegionProposer>>> {
    let Some(path) = model_path else {
        return Ok(None);
    };
    let proposer = super::tract::TractProposer::new(path, settings)?;
    log::info!("region proposer loaded from {}", path.display());
    Ok(Some(Box::new(proposer)))
}

/// Build the configured proposer, if any.
#[cfg(not(feature = "backend-tract"))]
pub fn load_proposer(
    model_path: Option<&Path>,
    _settings: ProposalSettings,
) -> Result<Option<Box<dyn RegionProposer>>> {
    match model_path {
        Some(path) => Err(anyhow!(
            "proposer model {} configured but the backend-tract feature is not enabled",
            path.display()
        )),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lay out anchors column-wise the way the model does: row-major [dims][anchors].
    fn model_output(anchors: &[[f32; 5]]) -> Vec<f32> {
        let mut out = vec![0.0; 5 * anchors.len()];
        for (a, values) in anchors.iter().enumerate() {
            for (row, v) in values.iter().enumerate() {
                out[row * anchors.len() + a] = *v;
            }
        }
        out
    }

    #[test]
    fn low_confidence_anchors_are_dropped() {
        let output = model_output(&[[320.0, 320.0, 64.0, 64.0, 0.30]]);
        let regions =
            postprocess(&output, 5, 1, 640, 640, &ProposalSettings::default()).unwrap();
        assert!(regions.is_empty());
    }

    #[test]
    fn boxes_scale_back_to_frame_pixels() {
        // 1280x960 frame: factors 2.0 and 1.5.
        let output = model_output(&[[320.0, 320.0, 64.0, 64.0, 0.90]]);
        let regions =
            postprocess(&output, 5, 1, 1280, 960, &ProposalSettings::default()).unwrap();
        assert_eq!(
            regions,
            vec![Region {
                x: 576,
                y: 432,
                width: 128,
                height: 96,
            }]
        );
    }

    #[test]
    fn overlapping_boxes_collapse_to_best() {
        let output = model_output(&[
            [100.0, 100.0, 50.0, 50.0, 0.60],
            [102.0, 101.0, 50.0, 50.0, 0.95],
            [400.0, 400.0, 40.0, 40.0, 0.50],
        ]);
        let regions =
            postprocess(&output, 5, 3, 640, 640, &ProposalSettings::default()).unwrap();
        assert_eq!(regions.len(), 2);
        // Highest score first: the (102, 101) box survives.
        assert_eq!(regions[0].x, 77);
        assert_eq!(regions[1].x, 380);
    }

    #[test]
    fn boxes_are_clipped_to_image() {
        let output = model_output(&[
            [10.0, 10.0, 60.0, 60.0, 0.9],
            [700.0, 700.0, 20.0, 20.0, 0.9],
        ]);
        let regions =
            postprocess(&output, 5, 2, 640, 640, &ProposalSettings::default()).unwrap();
        assert_eq!(
            regions,
            vec![Region {
                x: 0,
                y: 0,
                width: 40,
                height: 40,
            }]
        );
    }

    #[test]
    fn malformed_output_is_rejected() {
        assert!(postprocess(&[0.0; 8], 4, 2, 640, 640, &ProposalSettings::default()).is_err());
        assert!(postprocess(&[0.0; 8], 5, 2, 640, 640, &ProposalSettings::default()).is_err());
    }

    #[test]
    fn preprocess_is_planar_and_normalized() {
        let mut data = Vec::new();
        for _ in 0..(8 * 8) {
            data.extend_from_slice(&[255, 0, 51]);
        }
        let frame = Frame::from_rgb(data, 8, 8).unwrap();
        let tensor = preprocess(&frame, 4).unwrap();
        assert_eq!(tensor.len(), 3 * 4 * 4);
        // Allow one grey level of resampling error.
        let tol = 1.5 / 255.0;
        assert!(tensor[..16].iter().all(|v| (*v - 1.0).abs() < tol));
        assert!(tensor[16..32].iter().all(|v| v.abs() < tol));
        assert!(tensor[32..].iter().all(|v| (*v - 0.2).abs() < tol));
    }

    #[cfg(not(feature = "backend-tract"))]
    #[test]
    fn model_without_backend_is_a_config_error() {
        assert!(load_proposer(None, ProposalSettings::default())
            .unwrap()
            .is_none());
        assert!(load_proposer(Some(Path::new("qr.onnx")), ProposalSettings::default()).is_err());
    }
}
