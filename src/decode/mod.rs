//! Decode chain: turns one frame into at most one detection candidate.
//!
//! Strategies run in order and the first non-blank payload wins:
//! 1. `QuircDecoder` on the greyscale frame (fast path)
//! 2. `ZxingDecoder` on the same image, exhaustive search, QR only
//! 3. optional region proposals: each proposed crop goes through 1 and 2
//!
//! Most frames contain no code, so a miss is `None`, never an error. Decoder
//! errors and panics are swallowed here and logged at trace/debug level.

mod proposal;
mod quirc;
#[cfg(feature = "backend-tract")]
mod tract;
mod zxing;

pub use proposal::{
    load_proposer, non_max_suppression, postprocess, preprocess, ProposalBox, ProposalSettings,
    RegionProposer,
};
pub use quirc::QuircDecoder;
#[cfg(feature = "backend-tract")]
pub use tract::TractProposer;
pub use zxing::ZxingDecoder;

use anyhow::Result;
use image::GrayImage;
use std::panic::{self, AssertUnwindSafe};

use crate::frame::Frame;
use crate::geometry::{NormalizedBox, Point, Region};

/// Raw decoder output in the coordinates of the image it was given.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded {
    pub payload: String,
    pub corners: Vec<Point>,
}

impl Decoded {
    fn offset(self, region: Region) -> Self {
        let (dx, dy) = (region.x as f32, region.y as f32);
        Self {
            payload: self.payload,
            corners: self.corners.into_iter().map(|p| p.offset(dx, dy)).collect(),
        }
    }
}

/// A successful decode, in frame pixel space.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionCandidate {
    pub payload: String,
    /// Ordered corner points; empty when the decoder reported no geometry.
    pub corners: Vec<Point>,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Which strategy produced the hit.
    pub strategy: &'static str,
}

impl DetectionCandidate {
    pub fn bounding_box(&self) -> NormalizedBox {
        NormalizedBox::from_corners(&self.corners, self.frame_width, self.frame_height)
    }
}

/// A symbol decoder working on greyscale images.
pub trait SymbolDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` when the image holds no readable symbol.
    fn decode(&self, image: &GrayImage) -> Result<Option<Decoded>>;
}

pub struct DecodeChain {
    primary: Box<dyn SymbolDecoder>,
    fallback: Box<dyn SymbolDecoder>,
    proposer: Option<Box<dyn RegionProposer>>,
}

impl DecodeChain {
    pub fn new(primary: Box<dyn SymbolDecoder>, fallback: Box<dyn SymbolDecoder>) -> Self {
        Self {
            primary,
            fallback,
            proposer: None,
        }
    }

    /// quirc first, zxing (try-harder, QR only) second.
    pub fn standard() -> Self {
        Self::new(Box::new(QuircDecoder::new()), Box::new(ZxingDecoder::qr_only()))
    }

    pub fn with_proposer(mut self, proposer: Box<dyn RegionProposer>) -> Self {
        self.proposer = Some(proposer);
        self
    }

    pub fn decode(&self, frame: &Frame) -> Option<DetectionCandidate> {
        if frame.is_empty() {
            return None;
        }
        let gray = frame.to_luma();
        let (decoded, strategy) = self
            .decode_image(&gray)
            .or_else(|| self.decode_proposals(frame, &gray))?;

        Some(DetectionCandidate {
            payload: decoded.payload,
            corners: decoded.corners,
            frame_width: frame.width,
            frame_height: frame.height,
            strategy,
        })
    }

    fn decode_image(&self, gray: &GrayImage) -> Option<(Decoded, &'static str)> {
        [self.primary.as_ref(), self.fallback.as_ref()]
            .into_iter()
            .find_map(|decoder| attempt(decoder, gray).map(|d| (d, decoder.name())))
    }

    fn decode_proposals(&self, frame: &Frame, gray: &GrayImage) -> Option<(Decoded, &'static str)> {
        let proposer = self.proposer.as_ref()?;
        let regions = match panic::catch_unwind(AssertUnwindSafe(|| proposer.propose(frame))) {
            Ok(Ok(regions)) => regions,
            Ok(Err(e)) => {
                log::debug!("region proposer failed: {:#}", e);
                return None;
            }
            Err(_) => {
                log::debug!("region proposer panicked");
                return None;
            }
        };

        regions.into_iter().find_map(|region| {
            let crop =
                image::imageops::crop_imm(gray, region.x, region.y, region.width, region.height)
                    .to_image();
            self.decode_image(&crop)
                .map(|(decoded, _)| (decoded.offset(region), "proposal"))
        })
    }
}

impl Default for DecodeChain {
    fn default() -> Self {
        Self::standard()
    }
}

fn attempt(decoder: &dyn SymbolDecoder, image: &GrayImage) -> Option<Decoded> {
    match panic::catch_unwind(AssertUnwindSafe(|| decoder.decode(image))) {
        Ok(Ok(Some(decoded))) if !decoded.payload.trim().is_empty() => Some(decoded),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            log::trace!("{} decoder miss: {:#}", decoder.name(), e);
            None
        }
        Err(_) => {
            log::debug!("{} decoder panicked; treating frame as a miss", decoder.name());
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
