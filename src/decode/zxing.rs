use anyhow::Result;
use image::GrayImage;
use rxing::{BarcodeFormat, DecodeHintType, DecodeHintValue, DecodingHintDictionary};
use std::collections::HashSet;

use super::{Decoded, SymbolDecoder};
use crate::geometry::Point;

/// Fallback decoder: ZXing port (`rxing`) in try-harder mode.
#[derive(Clone, Debug)]
pub struct ZxingDecoder {
    formats: HashSet<BarcodeFormat>,
    try_harder: bool,
}

impl ZxingDecoder {
    /// Exhaustive search restricted to QR symbols.
    pub fn qr_only() -> Self {
        Self {
            formats: HashSet::from([BarcodeFormat::QR_CODE]),
            try_harder: true,
        }
    }

    fn hints(&self) -> DecodingHintDictionary {
        let mut hints = DecodingHintDictionary::new();
        hints.insert(
            DecodeHintType::TRY_HARDER,
            DecodeHintValue::TryHarder(self.try_harder),
        );
        hints.insert(
            DecodeHintType::POSSIBLE_FORMATS,
            DecodeHintValue::PossibleFormats(self.formats.clone()),
        );
        hints
    }
}

impl Default for ZxingDecoder {
    fn default() -> Self {
        Self::qr_only()
    }
}

impl SymbolDecoder for ZxingDecoder {
    fn name(&self) -> &'static str {
        "zxing"
    }

    fn decode(&self, image: &GrayImage) -> Result<Option<Decoded>> {
        let mut hints = self.hints();
        let single_format = if self.formats.len() == 1 {
            self.formats.iter().next().copied()
        } else {
            None
        };

        let result = match rxing::helpers::detect_in_luma_with_hints(
            image.as_raw().clone(),
            image.width(),
            image.height(),
            single_format,
            &mut hints,
        ) {
            Ok(result) => result,
            // rxing reports "nothing found" as an error; that is a plain miss.
            Err(e) => {
                log::trace!("zxing: {}", e);
                return Ok(None);
            }
        };

        let corners = result
            .getPoints()
            .iter()
            .map(|p| Point::new(p.x, p.y))
            .collect();
        Ok(Some(Decoded {
            payload: result.getText().to_string(),
            corners,
        }))
    }
}
