use anyhow::{anyhow, Result};
use image::GrayImage;

use super::{Decoded, SymbolDecoder};
use crate::geometry::Point;

/// Primary decoder: quirc-style QR grid finder (`rqrr`).
#[derive(Clone, Copy, Debug, Default)]
pub struct QuircDecoder;

impl QuircDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl SymbolDecoder for QuircDecoder {
    fn name(&self) -> &'static str {
        "quirc"
    }

    fn decode(&self, image: &GrayImage) -> Result<Option<Decoded>> {
        let mut prepared = rqrr::PreparedImage::prepare_from_greyscale(
            image.width() as usize,
            image.height() as usize,
            |x, y| image.get_pixel(x as u32, y as u32)[0],
        );

        let mut last_error = None;
        for grid in prepared.detect_grids() {
            match grid.decode() {
                Ok((_meta, payload)) => {
                    let corners = grid
                        .bounds
                        .iter()
                        .map(|p| Point::new(p.x as f32, p.y as f32))
                        .collect();
                    return Ok(Some(Decoded { payload, corners }));
                }
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            // A grid was found but could not be read: worth a trace line.
            Some(e) => Err(anyhow!("grid found but not decodable: {:?}", e)),
            None => Ok(None),
        }
    }
}
