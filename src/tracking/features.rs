//! Sparse visual features: Harris corners with binary descriptors.
//!
//! Feature extraction sits behind the [`FeatureExtractor`] trait so that the
//! odometry does not depend on a particular detector.

use image::{GrayImage, ImageBuffer, Luma, Pixel};
use imageproc::filter::box_filter;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::frame::ColorImage;

/// Binary descriptor length in bytes (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// Max descriptor distance for acceptance.
pub const TH_HIGH: u32 = 100;
/// Ratio test threshold (best / second best).
pub const NN_RATIO: f32 = 0.75;

/// Half size of the descriptor sampling patch.
const PATCH_RADIUS: i32 = 15;
/// Half size of the Harris structure tensor window.
const HARRIS_WINDOW: i32 = 2;
/// Fixed seed for the descriptor sampling pattern.
const PATTERN_SEED: u64 = 0xB81E_F00D;

pub type Descriptor = [u8; DESCRIPTOR_BYTES];

/// A detected keypoint with its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Pixel column.
    pub x: f32,
    /// Pixel row.
    pub y: f32,
    pub response: f32,
    pub descriptor: Descriptor,
}

/// Replaceable feature extraction strategy.
pub trait FeatureExtractor: Send {
    fn extract(&self, image: &ColorImage) -> Vec<Feature>;
}

/// Number of differing bits between two descriptors.
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Brute-force matching with a distance threshold and the ratio test.
///
/// Returns `(query_idx, train_idx)` pairs. Each train feature is used at most
/// once (the closer query wins).
pub fn match_features(
    query: &[Feature],
    train: &[Feature],
    max_distance: u32,
    ratio: f32,
) -> Vec<(usize, usize)> {
    // train_idx -> (query_idx, distance)
    let mut best_for_train: Vec<Option<(usize, u32)>> = vec![None; train.len()];

    for (qi, q) in query.iter().enumerate() {
        let mut best_dist = u32::MAX;
        let mut second_best_dist = u32::MAX;
        let mut best_idx = None;

        for (ti, t) in train.iter().enumerate() {
            let dist = descriptor_distance(&q.descriptor, &t.descriptor);
            if dist < best_dist {
                second_best_dist = best_dist;
                best_dist = dist;
                best_idx = Some(ti);
            } else if dist < second_best_dist {
                second_best_dist = dist;
            }
        }

        let Some(ti) = best_idx else { continue };
        if best_dist > max_distance {
            continue;
        }
        if second_best_dist != u32::MAX && best_dist as f32 >= ratio * second_best_dist as f32 {
            continue;
        }

        match best_for_train[ti] {
            Some((_, d)) if d <= best_dist => {}
            _ => best_for_train[ti] = Some((qi, best_dist)),
        }
    }

    best_for_train
        .iter()
        .enumerate()
        .filter_map(|(ti, m)| m.map(|(qi, _)| (qi, ti)))
        .collect()
}

/// Configuration for [`HarrisBriefExtractor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarrisConfig {
    pub max_features: usize,
    /// Harris sensitivity `k` in `det - k * trace²`.
    pub harris_k: f32,
    /// Minimum response as a fraction of the strongest response.
    pub quality_level: f32,
    /// Non-maximum suppression radius in pixels.
    pub nms_radius: i32,
}

impl Default for HarrisConfig {
    fn default() -> Self {
        Self {
            max_features: 500,
            harris_k: 0.04,
            quality_level: 0.01,
            nms_radius: 3,
        }
    }
}

/// Harris corner detector with BRIEF-style 256-bit descriptors.
pub struct HarrisBriefExtractor {
    config: HarrisConfig,
    /// Sampling pairs relative to the keypoint, one per descriptor bit.
    pattern: Vec<[(i32, i32); 2]>,
}

impl HarrisBriefExtractor {
    pub fn new(config: HarrisConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(PATTERN_SEED);
        let mut offset = || {
            (
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
                rng.gen_range(-PATCH_RADIUS..=PATCH_RADIUS),
            )
        };
        let pattern = (0..DESCRIPTOR_BYTES * 8)
            .map(|_| [offset(), offset()])
            .collect();
        Self { config, pattern }
    }

    fn describe(&self, smoothed: &GrayImage, x: i32, y: i32) -> Descriptor {
        let mut descriptor = [0u8; DESCRIPTOR_BYTES];
        for (bit, [a, b]) in self.pattern.iter().enumerate() {
            let va = clamped(smoothed, x + a.0, y + a.1);
            let vb = clamped(smoothed, x + b.0, y + b.1);
            if va < vb {
                descriptor[bit / 8] |= 1 << (bit % 8);
            }
        }
        descriptor
    }
}

impl Default for HarrisBriefExtractor {
    fn default() -> Self {
        Self::new(HarrisConfig::default())
    }
}

impl FeatureExtractor for HarrisBriefExtractor {
    fn extract(&self, image: &ColorImage) -> Vec<Feature> {
        let border = PATCH_RADIUS + 1;
        let (w, h) = (image.width as i32, image.height as i32);
        if w <= 2 * border || h <= 2 * border {
            return Vec::new();
        }

        let smoothed = box_filter(&to_gray(image), 1, 1);
        let response = harris_response(&smoothed, self.config.harris_k, border);

        let max_response = response.pixels().map(|p| p.0[0]).fold(0.0f32, f32::max);
        if max_response <= 0.0 {
            return Vec::new();
        }
        let threshold = max_response * self.config.quality_level;

        let r = self.config.nms_radius.max(1);
        let mut candidates = Vec::new();
        for y in border..h - border {
            for x in border..w - border {
                let v = clamped(&response, x, y);
                if v > threshold && is_local_max(&response, x, y, r) {
                    candidates.push((x, y, v));
                }
            }
        }

        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));
        candidates.truncate(self.config.max_features);

        candidates
            .into_iter()
            .map(|(x, y, v)| Feature {
                x: x as f32,
                y: y as f32,
                response: v,
                descriptor: self.describe(&smoothed, x, y),
            })
            .collect()
    }
}

/// Float-valued single-channel map (gradient products, Harris response).
type ResponseMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Luminance of `image` quantized to 8 bits.
fn to_gray(image: &ColorImage) -> GrayImage {
    GrayImage::from_fn(image.width as u32, image.height as u32, |x, y| {
        let l = image.luminance(x as usize, y as usize).unwrap_or(0.0);
        Luma([l.round().clamp(0.0, 255.0) as u8])
    })
}

/// Pixel value with coordinates clamped to the image.
fn clamped<P>(img: &ImageBuffer<P, Vec<P::Subpixel>>, x: i32, y: i32) -> f32
where
    P: Pixel,
    P::Subpixel: Into<f32>,
{
    let x = x.clamp(0, img.width() as i32 - 1) as u32;
    let y = y.clamp(0, img.height() as i32 - 1) as u32;
    img.get_pixel(x, y).channels()[0].into()
}

/// Harris response `det(M) - k trace(M)²`, zero outside `border`.
fn harris_response(img: &GrayImage, k: f32, border: i32) -> ResponseMap {
    let (w, h) = (img.width() as i32, img.height() as i32);

    let mut ixx = ResponseMap::new(img.width(), img.height());
    let mut iyy = ResponseMap::new(img.width(), img.height());
    let mut ixy = ResponseMap::new(img.width(), img.height());
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = 0.5 * (clamped(img, x + 1, y) - clamped(img, x - 1, y));
            let gy = 0.5 * (clamped(img, x, y + 1) - clamped(img, x, y - 1));
            let (px, py) = (x as u32, y as u32);
            ixx.put_pixel(px, py, Luma([gx * gx]));
            iyy.put_pixel(px, py, Luma([gy * gy]));
            ixy.put_pixel(px, py, Luma([gx * gy]));
        }
    }

    let mut response = ResponseMap::new(img.width(), img.height());
    for y in border..h - border {
        for x in border..w - border {
            let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
            for dy in -HARRIS_WINDOW..=HARRIS_WINDOW {
                for dx in -HARRIS_WINDOW..=HARRIS_WINDOW {
                    a += clamped(&ixx, x + dx, y + dy);
                    b += clamped(&iyy, x + dx, y + dy);
                    c += clamped(&ixy, x + dx, y + dy);
                }
            }
            let det = a * b - c * c;
            let trace = a + b;
            response.put_pixel(x as u32, y as u32, Luma([det - k * trace * trace]));
        }
    }
    response
}

/// Strict maximum over earlier pixels, non-strict over later ones, so a
/// plateau yields exactly one keypoint.
fn is_local_max(response: &ResponseMap, x: i32, y: i32, r: i32) -> bool {
    let v = clamped(response, x, y);
    for dy in -r..=r {
        for dx in -r..=r {
            if dx == 0 && dy == 0 {
                continue;
            }
            let n = clamped(response, x + dx, y + dy);
            let earlier = dy < 0 || (dy == 0 && dx < 0);
            if n > v || (earlier && n == v) {
                return false;
            }
        }
    }
    true
}
