//! Frame-to-frame RGB-D odometry.
//!
//! The default [`FeatureOdometry`] works in three steps:
//! 1. Extract features and attach the 3D point behind each one
//! 2. Match against the reference frame and align the matched 3D points
//!    with rigid RANSAC (falling back to the motion prior)
//! 3. Score the estimate by how much of the current cloud lands on the
//!    reference cloud once transformed
//!
//! The reference frame only advances when the frontend accepts an estimate,
//! so after a failure the next frames are matched against the last good one.

use std::collections::HashMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::frame::RawFrame;
use crate::geometry::{RigidRansacConfig, SE3, align_rigid_ransac};

use super::features::{
    Feature, FeatureExtractor, HarrisBriefExtractor, HarrisConfig, NN_RATIO, TH_HIGH,
    match_features,
};

/// Outcome of tracking one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct OdometryEstimate {
    /// Estimated camera-to-world pose.
    pub pose: SE3,
    /// Tracking confidence in [0, 1].
    pub confidence: f64,
    pub num_features: usize,
    pub num_matches: usize,
    pub num_inliers: usize,
    /// Whether the pose came from feature alignment rather than the prior.
    pub used_features: bool,
}

impl OdometryEstimate {
    /// Estimate that simply repeats the prior.
    pub fn from_prior(pose: SE3, confidence: f64) -> Self {
        Self {
            pose,
            confidence,
            num_features: 0,
            num_matches: 0,
            num_inliers: 0,
            used_features: false,
        }
    }
}

/// Replaceable pose tracking strategy.
pub trait Odometry: Send {
    /// Estimate the pose of `frame` given the motion-model prediction.
    fn track(&mut self, frame: &RawFrame, predicted: &SE3) -> OdometryEstimate;

    /// The frontend accepted the last estimate, refined to `pose`.
    fn accept(&mut self, pose: &SE3);

    /// Forget all tracking history.
    fn reset(&mut self);
}

/// Configuration for [`FeatureOdometry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OdometryConfig {
    pub features: HarrisConfig,
    pub max_descriptor_distance: u32,
    pub nn_ratio: f32,
    /// Matches needed before attempting alignment.
    pub min_matches: usize,
    pub ransac: RigidRansacConfig,
    /// Pixel radius for attaching a cloud point to a feature.
    pub association_radius_px: i32,
    /// Point-to-point distance (m) counted as overlap.
    pub verification_radius: f64,
    /// Cap on points used for verification (uniform subsampling).
    pub max_verification_points: usize,
}

impl Default for OdometryConfig {
    fn default() -> Self {
        Self {
            features: HarrisConfig::default(),
            max_descriptor_distance: TH_HIGH,
            nn_ratio: NN_RATIO,
            min_matches: 12,
            ransac: RigidRansacConfig::default(),
            association_radius_px: 2,
            verification_radius: 0.1,
            max_verification_points: 2000,
        }
    }
}

/// Feature-based odometry with geometric verification.
pub struct FeatureOdometry {
    config: OdometryConfig,
    extractor: Box<dyn FeatureExtractor>,
    /// Last accepted frame.
    reference: Option<TrackedFrame>,
    /// Frame from the last `track` call, promoted by `accept`.
    candidate: Option<TrackedFrame>,
}

struct TrackedFrame {
    pose: SE3,
    features: Vec<Feature>,
    /// `feature_points[i]` is the camera-frame point under `features[i]`.
    feature_points: Vec<Vector3<f64>>,
    grid: PointGrid,
}

impl FeatureOdometry {
    pub fn new(config: OdometryConfig) -> Self {
        let extractor = Box::new(HarrisBriefExtractor::new(config.features.clone()));
        Self::with_extractor(config, extractor)
    }

    pub fn with_extractor(config: OdometryConfig, extractor: Box<dyn FeatureExtractor>) -> Self {
        Self {
            config,
            extractor,
            reference: None,
            candidate: None,
        }
    }

    /// Features that have a valid 3D point, with those points.
    fn features_with_depth(&self, frame: &RawFrame) -> (Vec<Feature>, Vec<Vector3<f64>>) {
        let features = self.extractor.extract(&frame.image);
        if features.is_empty() {
            return (Vec::new(), Vec::new());
        }

        let mut by_pixel: HashMap<(i64, i64), usize> = HashMap::new();
        for (i, (p, uv)) in frame.points.iter().zip(&frame.tex_coords).enumerate() {
            if !p.iter().all(|v| v.is_finite()) {
                continue;
            }
            if let Some((x, y)) = frame.image.texel(uv) {
                by_pixel.entry((x as i64, y as i64)).or_insert(i);
            }
        }

        let r = i64::from(self.config.association_radius_px.max(0));
        let mut kept = Vec::new();
        let mut points = Vec::new();
        for f in features {
            let (fx, fy) = (f.x.round() as i64, f.y.round() as i64);
            let mut best: Option<(i64, usize)> = None;
            for dy in -r..=r {
                for dx in -r..=r {
                    if let Some(&idx) = by_pixel.get(&(fx + dx, fy + dy)) {
                        let d2 = dx * dx + dy * dy;
                        if best.map_or(true, |(bd, _)| d2 < bd) {
                            best = Some((d2, idx));
                        }
                    }
                }
            }
            if let Some((_, idx)) = best {
                points.push(frame.points[idx].cast::<f64>());
                kept.push(f);
            }
        }
        (kept, points)
    }
}

impl Default for FeatureOdometry {
    fn default() -> Self {
        Self::new(OdometryConfig::default())
    }
}

impl Odometry for FeatureOdometry {
    fn track(&mut self, frame: &RawFrame, predicted: &SE3) -> OdometryEstimate {
        let (features, feature_points) = self.features_with_depth(frame);
        let cloud = subsample_cloud(frame, self.config.max_verification_points);
        let num_features = features.len();

        let Some(reference) = self.reference.as_ref() else {
            // Bootstrap: the first frame defines its own pose.
            let confidence = if cloud.is_empty() { 0.0 } else { 1.0 };
            self.candidate = Some(TrackedFrame {
                pose: *predicted,
                features,
                feature_points,
                grid: PointGrid::new(&cloud, self.config.verification_radius),
            });
            return OdometryEstimate {
                num_features,
                ..OdometryEstimate::from_prior(*predicted, confidence)
            };
        };

        let matches = match_features(
            &features,
            &reference.features,
            self.config.max_descriptor_distance,
            self.config.nn_ratio,
        );

        let prior_relative = reference.pose.inverse() * *predicted;
        let mut num_inliers = 0;
        let mut used_features = false;
        let relative = if matches.len() >= self.config.min_matches {
            let current: Vec<_> = matches.iter().map(|&(q, _)| feature_points[q]).collect();
            let previous: Vec<_> = matches
                .iter()
                .map(|&(_, t)| reference.feature_points[t])
                .collect();
            match align_rigid_ransac(&current, &previous, &self.config.ransac) {
                Some(alignment) => {
                    num_inliers = alignment.num_inliers();
                    used_features = true;
                    alignment.transform
                }
                None => prior_relative,
            }
        } else {
            prior_relative
        };

        let confidence = reference
            .grid
            .overlap_ratio(&cloud, &relative, self.config.verification_radius);
        let pose = reference.pose * relative;

        self.candidate = Some(TrackedFrame {
            pose,
            features,
            feature_points,
            grid: PointGrid::new(&cloud, self.config.verification_radius),
        });

        OdometryEstimate {
            pose,
            confidence,
            num_features,
            num_matches: matches.len(),
            num_inliers,
            used_features,
        }
    }

    fn accept(&mut self, pose: &SE3) {
        if let Some(mut candidate) = self.candidate.take() {
            candidate.pose = *pose;
            self.reference = Some(candidate);
        }
    }

    fn reset(&mut self) {
        self.reference = None;
        self.candidate = None;
    }
}

/// Finite cloud points, uniformly subsampled to at most `max_points`.
fn subsample_cloud(frame: &RawFrame, max_points: usize) -> Vec<Vector3<f64>> {
    let max_points = max_points.max(1);
    let stride = frame.points.len().div_ceil(max_points).max(1);
    frame
        .points
        .iter()
        .step_by(stride)
        .filter(|p| p.iter().all(|v| v.is_finite()))
        .map(|p| p.cast::<f64>())
        .collect()
}

/// Hashed grid for fixed-radius neighbor queries.
struct PointGrid {
    cell: f64,
    cells: HashMap<(i64, i64, i64), Vec<Vector3<f64>>>,
}

impl PointGrid {
    fn new(points: &[Vector3<f64>], cell: f64) -> Self {
        let cell = if cell > 0.0 { cell } else { 1.0 };
        let mut cells: HashMap<_, Vec<_>> = HashMap::new();
        for p in points {
            cells.entry(Self::key(p, cell)).or_default().push(*p);
        }
        Self { cell, cells }
    }

    fn key(p: &Vector3<f64>, cell: f64) -> (i64, i64, i64) {
        (
            (p.x / cell).floor() as i64,
            (p.y / cell).floor() as i64,
            (p.z / cell).floor() as i64,
        )
    }

    fn has_neighbor(&self, p: &Vector3<f64>, radius: f64) -> bool {
        let (kx, ky, kz) = Self::key(p, self.cell);
        let r2 = radius * radius;
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if let Some(bucket) = self.cells.get(&(kx + dx, ky + dy, kz + dz)) {
                        if bucket.iter().any(|q| (q - p).norm_squared() <= r2) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Fraction of `points` (current camera frame) that land within
    /// `radius` of a grid point after mapping by `relative` (current to
    /// grid frame). Zero for an empty input.
    fn overlap_ratio(&self, points: &[Vector3<f64>], relative: &SE3, radius: f64) -> f64 {
        if points.is_empty() || self.cells.is_empty() {
            return 0.0;
        }
        let hits = points
            .iter()
            .filter(|p| self.has_neighbor(&relative.transform_point(p), radius))
            .count();
        hits as f64 / points.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ColorImage;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    fn plane_frame(t: f64, shift_x: f32) -> RawFrame {
        let mut points = Vec::new();
        let mut tex = Vec::new();
        for j in 0..20 {
            for i in 0..20 {
                points.push(Vector3::new(i as f32 * 0.05 - 0.5 - shift_x, j as f32 * 0.05 - 0.5, 2.0));
                tex.push(Vector2::new(i as f32 / 20.0, j as f32 / 20.0));
            }
        }
        RawFrame::new(t, points, tex, ColorImage::filled(8, 8, [100, 100, 100]))
    }

    #[test]
    fn test_bootstrap_confidence() {
        let mut odometry = FeatureOdometry::default();
        let empty = RawFrame::new(0.0, vec![], vec![], ColorImage::filled(8, 8, [0, 0, 0]));

        assert_eq!(odometry.track(&empty, &SE3::identity()).confidence, 0.0);
        assert_eq!(odometry.track(&plane_frame(0.0, 0.0), &SE3::identity()).confidence, 1.0);
    }

    #[test]
    fn test_prior_verified_against_reference() {
        let mut odometry = FeatureOdometry::default();
        odometry.track(&plane_frame(0.0, 0.0), &SE3::identity());
        odometry.accept(&SE3::identity());

        // Scene shifted by 0.02 m in camera x: the correct prior overlaps fully.
        let truth = SE3::from_translation(Vector3::new(0.02, 0.0, 0.0));
        let good = odometry.track(&plane_frame(0.1, 0.02), &truth);
        assert!(!good.used_features);
        assert_relative_eq!(good.confidence, 1.0);
        assert_relative_eq!(good.pose.translation, truth.translation, epsilon = 1e-12);

        // A prior one meter off finds no overlap.
        let bad = odometry.track(
            &plane_frame(0.1, 0.02),
            &SE3::from_translation(Vector3::new(0.0, 0.0, 1.0)),
        );
        assert_eq!(bad.confidence, 0.0);
    }

    #[test]
    fn test_reference_only_advances_on_accept() {
        let mut odometry = FeatureOdometry::default();
        odometry.track(&plane_frame(0.0, 0.0), &SE3::identity());
        odometry.accept(&SE3::identity());

        // Rejected frame far away.
        let far = SE3::from_translation(Vector3::new(5.0, 0.0, 0.0));
        odometry.track(&plane_frame(0.1, 0.0), &far);

        // Still compared against the first frame.
        let again = odometry.track(&plane_frame(0.2, 0.0), &SE3::identity());
        assert_relative_eq!(again.confidence, 1.0);
    }

    #[test]
    fn test_point_grid_overlap() {
        let points = vec![Vector3::new(0.0, 0.0, 1.0), Vector3::new(1.0, 0.0, 1.0)];
        let grid = PointGrid::new(&points, 0.1);

        let query = vec![Vector3::new(0.05, 0.0, 1.0), Vector3::new(3.0, 0.0, 1.0)];
        assert_relative_eq!(grid.overlap_ratio(&query, &SE3::identity(), 0.1), 0.5);
    }
}
