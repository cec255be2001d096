//! Sensor input types: color image and raw RGB-D frame.

use nalgebra::{Vector2, Vector3};

/// Color returned when a texture coordinate cannot be sampled.
pub const NEUTRAL_GRAY: f32 = 0.5;

/// Interleaved 8-bit color image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ColorImage {
    pub width: usize,
    pub height: usize,
    /// 1 = gray, 2 = gray + alpha, 3 = RGB, 4 = RGBA.
    pub bytes_per_pixel: usize,
    /// Row-major pixel buffer, `width * height * bytes_per_pixel` bytes.
    pub pixels: Vec<u8>,
}

impl ColorImage {
    pub fn new(width: usize, height: usize, bytes_per_pixel: usize, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel,
            pixels,
        }
    }

    /// Uniform RGB image.
    pub fn filled(width: usize, height: usize, rgb: [u8; 3]) -> Self {
        let mut pixels = Vec::with_capacity(width * height * 3);
        for _ in 0..width * height {
            pixels.extend_from_slice(&rgb);
        }
        Self::new(width, height, 3, pixels)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// RGB bytes of pixel (x, y), or `None` if outside the buffer.
    pub fn pixel_rgb(&self, x: usize, y: usize) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.bytes_per_pixel;
        let offset = (y * self.width + x) * bpp;
        let px = self.pixels.get(offset..offset + bpp)?;
        match bpp {
            1 | 2 => Some([px[0], px[0], px[0]]),
            3 | 4 => Some([px[0], px[1], px[2]]),
            _ => None,
        }
    }

    /// Luminance of pixel (x, y) in [0, 255].
    pub fn luminance(&self, x: usize, y: usize) -> Option<f32> {
        self.pixel_rgb(x, y).map(|[r, g, b]| {
            0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b)
        })
    }

    /// Sample the color at texture coordinate `uv` ∈ [0, 1]², RGB in [0, 1].
    ///
    /// Returns `None` for coordinates outside the image or a malformed buffer.
    pub fn sample(&self, uv: &Vector2<f32>) -> Option<Vector3<f32>> {
        let (x, y) = self.texel(uv)?;
        self.pixel_rgb(x, y).map(|[r, g, b]| {
            Vector3::new(f32::from(r), f32::from(g), f32::from(b)) / 255.0
        })
    }

    /// Pixel addressed by a texture coordinate.
    pub fn texel(&self, uv: &Vector2<f32>) -> Option<(usize, usize)> {
        if self.is_empty() || !uv.x.is_finite() || !uv.y.is_finite() {
            return None;
        }
        if !(0.0..=1.0).contains(&uv.x) || !(0.0..=1.0).contains(&uv.y) {
            return None;
        }
        let x = ((uv.x * self.width as f32) as usize).min(self.width - 1);
        let y = ((uv.y * self.height as f32) as usize).min(self.height - 1);
        Some((x, y))
    }
}

/// One frame as delivered by the sensor source.
///
/// `points[i]` is in sensor-local coordinates and `tex_coords[i]` is its
/// position in `image`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawFrame {
    /// Seconds, monotonically increasing.
    pub timestamp: f64,
    pub points: Vec<Vector3<f32>>,
    pub tex_coords: Vec<Vector2<f32>>,
    pub image: ColorImage,
}

impl RawFrame {
    pub fn new(
        timestamp: f64,
        points: Vec<Vector3<f32>>,
        tex_coords: Vec<Vector2<f32>>,
        image: ColorImage,
    ) -> Self {
        Self {
            timestamp,
            points,
            tex_coords,
            image,
        }
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }
}
