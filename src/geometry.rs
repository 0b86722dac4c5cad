//! Image-space geometry shared by the decoders, the region proposer and the
//! event payloads.

use serde::Serialize;

/// A point in frame pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Shift by a crop origin.
    pub fn offset(self, dx: f32, dy: f32) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

/// Bounding box expressed as percentages of the frame extent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct NormalizedBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl NormalizedBox {
    /// Axis-aligned box around `corners`, as percentages of `width`/`height`.
    ///
    /// Fewer than two corners yields an all-zero box. The top-left corner is
    /// clamped to the frame origin and every component is at least zero.
    pub fn from_corners(corners: &[Point], width: u32, height: u32) -> Self {
        if corners.len() < 2 || width == 0 || height == 0 {
            return Self::default();
        }

        let (mut min_x, mut min_y) = (f32::INFINITY, f32::INFINITY);
        let (mut max_x, mut max_y) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
        for p in corners {
            min_x = min_x.min(p.x);
            min_y = min_y.min(p.y);
            max_x = max_x.max(p.x);
            max_y = max_y.max(p.y);
        }
        let min_x = min_x.max(0.0) as f64;
        let min_y = min_y.max(0.0) as f64;
        let max_x = max_x as f64;
        let max_y = max_y as f64;
        let width = width as f64;
        let height = height as f64;

        Self {
            x: min_x / width * 100.0,
            y: min_y / height * 100.0,
            w: ((max_x - min_x) / width * 100.0).max(0.0),
            h: ((max_y - min_y) / height * 100.0).max(0.0),
        }
    }
}

/// Integer pixel rectangle, always inside the image it was clipped to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn normalizes_corner_span_to_percentages() {
        let corners = [
            Point::new(40.0, 30.0),
            Point::new(140.0, 30.0),
            Point::new(140.0, 90.0),
            Point::new(40.0, 90.0),
        ];
        let b = NormalizedBox::from_corners(&corners, 400, 300);
        assert!(close(b.x, 10.0));
        assert!(close(b.y, 10.0));
        assert!(close(b.w, 25.0));
        assert!(close(b.h, 20.0));
    }

    #[test]
    fn clamps_negative_origin() {
        let corners = [Point::new(-20.0, -10.0), Point::new(80.0, 60.0)];
        let b = NormalizedBox::from_corners(&corners, 400, 300);
        assert_eq!(b.x, 0.0);
        assert_eq!(b.y, 0.0);
        assert!(close(b.w, 20.0));
        assert!(close(b.h, 20.0));
    }

    #[test]
    fn missing_geometry_is_zero_box() {
        assert_eq!(
            NormalizedBox::from_corners(&[Point::new(5.0, 5.0)], 400, 300),
            NormalizedBox::default()
        );
        assert_eq!(
            NormalizedBox::from_corners(&[], 400, 300),
            NormalizedBox::default()
        );
    }
}
