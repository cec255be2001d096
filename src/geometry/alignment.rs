//! Rigid 3D-3D alignment using Horn's method with RANSAC.
//!
//! RGB-D frames carry metric depth, so scale is always fixed to 1.0 and the
//! solver returns an [`SE3`].

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::SE3;

/// Configuration for the rigid RANSAC solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RigidRansacConfig {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Inlier threshold in meters (point-to-point error).
    pub inlier_threshold: f64,
    /// Minimum number of inliers required.
    pub min_inliers: usize,
    /// Probability of finding a good model.
    pub probability: f64,
    /// Seed for the sampler. Fixed so that runs are reproducible.
    pub seed: u64,
}

impl Default for RigidRansacConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            inlier_threshold: 0.05,
            min_inliers: 8,
            probability: 0.99,
            seed: 0x5eed,
        }
    }
}

/// Result from the rigid RANSAC solver.
#[derive(Debug, Clone)]
pub struct RigidAlignment {
    /// Transform T such that `points2 ≈ T * points1`.
    pub transform: SE3,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
    /// Mean squared error of inliers.
    pub mse: f64,
}

impl RigidAlignment {
    pub fn num_inliers(&self) -> usize {
        self.inliers.len()
    }
}

/// Compute the rigid transform T with `points2 ≈ T * points1` using RANSAC.
///
/// Returns `None` if fewer than `config.min_inliers` correspondences agree.
pub fn align_rigid_ransac(
    points1: &[Vector3<f64>],
    points2: &[Vector3<f64>],
    config: &RigidRansacConfig,
) -> Option<RigidAlignment> {
    let n = points1.len();
    if n < 3 || n != points2.len() || n < config.min_inliers {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best: Option<RigidAlignment> = None;
    let mut max_iter = config.max_iterations;
    let mut iteration = 0;

    while iteration < max_iter {
        iteration += 1;

        let indices = sample_three_indices(&mut rng, n);
        let sample1: Vec<_> = indices.iter().map(|&i| points1[i]).collect();
        let sample2: Vec<_> = indices.iter().map(|&i| points2[i]).collect();

        let Some(transform) = align_rigid_horn(&sample1, &sample2) else {
            continue;
        };

        let (inliers, mse) = find_inliers(points1, points2, &transform, config.inlier_threshold);
        let best_count = best.as_ref().map_or(0, RigidAlignment::num_inliers);

        if inliers.len() > best_count {
            let count = inliers.len();
            best = Some(RigidAlignment {
                transform,
                inliers,
                mse,
            });

            if count >= config.min_inliers {
                let ratio = count as f64 / n as f64;
                let needed = compute_adaptive_iterations(ratio, config.probability, 3);
                max_iter = max_iter.min(iteration.saturating_add(needed));
            }
        }
    }

    // Refine on all inliers
    if let Some(ref mut result) = best {
        if result.num_inliers() >= config.min_inliers {
            let inlier1: Vec<_> = result.inliers.iter().map(|&i| points1[i]).collect();
            let inlier2: Vec<_> = result.inliers.iter().map(|&i| points2[i]).collect();

            if let Some(refined) = align_rigid_horn(&inlier1, &inlier2) {
                let (inliers, mse) =
                    find_inliers(points1, points2, &refined, config.inlier_threshold);
                if inliers.len() >= result.num_inliers() {
                    result.transform = refined;
                    result.inliers = inliers;
                    result.mse = mse;
                }
            }
        }
    }

    best.filter(|r| r.num_inliers() >= config.min_inliers)
}

/// Closed-form rigid alignment (Horn / Kabsch).
///
/// 1. Center both point sets on their centroids
/// 2. SVD of the cross-covariance H = Σ p1 p2ᵀ
/// 3. R = V Uᵀ with reflection correction
/// 4. t = c2 − R c1
pub fn align_rigid_horn(points1: &[Vector3<f64>], points2: &[Vector3<f64>]) -> Option<SE3> {
    let n = points1.len();
    if n < 3 || n != points2.len() {
        return None;
    }

    let centroid1 = centroid(points1);
    let centroid2 = centroid(points2);

    let mut h = Matrix3::zeros();
    for (p1, p2) in points1.iter().zip(points2) {
        h += (p1 - centroid1) * (p2 - centroid2).transpose();
    }

    // Degenerate: all points coincide
    if h.norm() < 1e-12 {
        return None;
    }

    let svd = h.svd(true, true);
    let u = svd.u?;
    let v = svd.v_t?.transpose();

    let mut rotation_mat = v * u.transpose();
    if rotation_mat.determinant() < 0.0 {
        let mut v_fixed = v;
        for i in 0..3 {
            v_fixed[(i, 2)] = -v_fixed[(i, 2)];
        }
        rotation_mat = v_fixed * u.transpose();
    }

    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_mat));
    let translation = centroid2 - rotation * centroid1;

    Some(SE3 {
        rotation,
        translation,
    })
}

fn centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::zeros();
    }
    let sum: Vector3<f64> = points.iter().sum();
    sum / points.len() as f64
}

fn find_inliers(
    points1: &[Vector3<f64>],
    points2: &[Vector3<f64>],
    transform: &SE3,
    threshold: f64,
) -> (Vec<usize>, f64) {
    let threshold_sq = threshold * threshold;
    let mut inliers = Vec::new();
    let mut sum_sq_error = 0.0;

    for (i, (p1, p2)) in points1.iter().zip(points2).enumerate() {
        let error_sq = (transform.transform_point(p1) - p2).norm_squared();
        if error_sq < threshold_sq {
            inliers.push(i);
            sum_sq_error += error_sq;
        }
    }

    let mse = if inliers.is_empty() {
        f64::INFINITY
    } else {
        sum_sq_error / inliers.len() as f64
    };

    (inliers, mse)
}

fn sample_three_indices(rng: &mut impl Rng, n: usize) -> [usize; 3] {
    let mut indices = [0usize; 3];
    indices[0] = rng.gen_range(0..n);

    loop {
        indices[1] = rng.gen_range(0..n);
        if indices[1] != indices[0] {
            break;
        }
    }

    loop {
        indices[2] = rng.gen_range(0..n);
        if indices[2] != indices[0] && indices[2] != indices[1] {
            break;
        }
    }

    indices
}

/// k = log(1 - p) / log(1 - w^n)
fn compute_adaptive_iterations(inlier_ratio: f64, probability: f64, sample_size: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }

    let w_n = inlier_ratio.powi(sample_size as i32);
    let log_denom = (1.0 - w_n).ln();
    if log_denom.abs() < 1e-10 {
        return 1;
    }

    let k = (1.0 - probability).ln() / log_denom;
    (k.ceil() as usize).max(1)
}
