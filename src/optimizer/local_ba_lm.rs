//! Local Bundle Adjustment using Levenberg-Marquardt optimizer.
//!
//! Minimizes the robustified normalized reprojection error
//!
//! ```text
//! E = Σ_ij ρ(||u_ij - π(T_i, p_j)||²)
//! ```
//!
//! where `u_ij` are the observed normalized coordinates of point `j` in
//! keyframe `i`, `π(T, p) = (x/z, y/z)` of `T * p`, and `ρ` is the Huber
//! kernel. Poses are parameterized as world-to-camera axis-angle +
//! translation.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{DMatrix, DVector, Dyn, Matrix2x3, Owned, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::refiner::{MapRefiner, Refinement, RefinementProblem};
use crate::error::RefineError;
use crate::geometry::SE3;

/// Minimum depth for a valid projection.
const MIN_DEPTH: f64 = 1e-3;
/// Residual assigned to points behind the camera.
const BEHIND_CAMERA_ERROR: f64 = 1.0;
/// Step for the numerical pose Jacobian.
const POSE_JACOBIAN_EPS: f64 = 1e-6;

/// Configuration for LM-based Local Bundle Adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBAConfigLM {
    /// Evaluation budget multiplier (`patience * (n + 1)` evaluations).
    pub patience: usize,
    /// Convergence threshold on relative cost and parameter change.
    pub tolerance: f64,
    /// Huber kernel threshold in normalized image units.
    pub huber_threshold: f64,
}

impl Default for LocalBAConfigLM {
    fn default() -> Self {
        Self {
            patience: 20,
            tolerance: 1e-10,
            huber_threshold: 0.01,
        }
    }
}

/// Default [`MapRefiner`].
#[derive(Debug, Clone, Default)]
pub struct LmRefiner {
    config: LocalBAConfigLM,
}

impl LmRefiner {
    pub fn new(config: LocalBAConfigLM) -> Self {
        Self { config }
    }
}

/// Observation with resolved parameter indices.
struct BAObservation {
    /// Index of the pose block, `None` for fixed poses.
    pose_param_idx: Option<usize>,
    /// Fixed world-to-camera pose when `pose_param_idx` is `None`.
    fixed_pose_cw: SE3,
    point_param_idx: usize,
    observed: Vector2<f64>,
}

/// The Bundle Adjustment problem for LM solver.
struct BAProblem {
    params: DVector<f64>,
    observations: Vec<BAObservation>,
    num_pose_params: usize,
    huber_threshold: f64,
}

impl BAProblem {
    fn pose_cw(&self, params: &DVector<f64>, obs: &BAObservation) -> SE3 {
        match obs.pose_param_idx {
            Some(idx) => pose_from_params(params, idx),
            None => obs.fixed_pose_cw,
        }
    }

    fn point(&self, params: &DVector<f64>, idx: usize) -> Vector3<f64> {
        let base = self.num_pose_params * 6 + idx * 3;
        Vector3::new(params[base], params[base + 1], params[base + 2])
    }

    /// Error = observed - projected.
    fn compute_error(pose_cw: &SE3, point: &Vector3<f64>, observed: &Vector2<f64>) -> Vector2<f64> {
        let p_cam = pose_cw.transform_point(point);
        if p_cam.z <= MIN_DEPTH {
            return Vector2::repeat(BEHIND_CAMERA_ERROR);
        }
        observed - Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z)
    }

    /// d(error)/d(point) = -1/z [1, 0, -x/z; 0, 1, -y/z] R_cw
    fn jacobian_point(pose_cw: &SE3, point: &Vector3<f64>) -> Matrix2x3<f64> {
        let p_cam = pose_cw.transform_point(point);
        if p_cam.z <= MIN_DEPTH {
            return Matrix2x3::zeros();
        }
        let invz = 1.0 / p_cam.z;
        let tmp = Matrix2x3::new(
            1.0, 0.0, -p_cam.x * invz,
            0.0, 1.0, -p_cam.y * invz,
        );
        let r_cw = pose_cw.rotation.to_rotation_matrix().into_inner();
        (-invz) * tmp * r_cw
    }

    fn huber_weight(&self, error_norm: f64) -> f64 {
        if error_norm <= self.huber_threshold {
            1.0
        } else {
            self.huber_threshold / error_norm
        }
    }

    fn residuals_at(&self, params: &DVector<f64>) -> DVector<f64> {
        let mut residuals = DVector::zeros(self.observations.len() * 2);
        for (i, obs) in self.observations.iter().enumerate() {
            let pose_cw = self.pose_cw(params, obs);
            let point = self.point(params, obs.point_param_idx);
            let error = Self::compute_error(&pose_cw, &point, &obs.observed);
            let weighted = error * self.huber_weight(error.norm()).sqrt();
            residuals[i * 2] = weighted.x;
            residuals[i * 2 + 1] = weighted.y;
        }
        residuals
    }

    fn jacobian_at(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let num_params = params.len();
        let mut jacobian = DMatrix::zeros(self.observations.len() * 2, num_params);

        for (i, obs) in self.observations.iter().enumerate() {
            let pose_cw = self.pose_cw(params, obs);
            let point = self.point(params, obs.point_param_idx);
            let error = Self::compute_error(&pose_cw, &point, &obs.observed);
            let weight_sqrt = self.huber_weight(error.norm()).sqrt();

            // Pose block: central differences on the 6 parameters.
            if let Some(pose_idx) = obs.pose_param_idx {
                let mut perturbed = params.clone();
                for k in 0..6 {
                    let col = pose_idx * 6 + k;
                    let original = params[col];

                    perturbed[col] = original + POSE_JACOBIAN_EPS;
                    let e_plus =
                        Self::compute_error(&pose_from_params(&perturbed, pose_idx), &point, &obs.observed);
                    perturbed[col] = original - POSE_JACOBIAN_EPS;
                    let e_minus =
                        Self::compute_error(&pose_from_params(&perturbed, pose_idx), &point, &obs.observed);
                    perturbed[col] = original;

                    let d = (e_plus - e_minus) / (2.0 * POSE_JACOBIAN_EPS) * weight_sqrt;
                    jacobian[(i * 2, col)] = d.x;
                    jacobian[(i * 2 + 1, col)] = d.y;
                }
            }

            let j_point = Self::jacobian_point(&pose_cw, &point) * weight_sqrt;
            let col_base = self.num_pose_params * 6 + obs.point_param_idx * 3;
            for row in 0..2 {
                for col in 0..3 {
                    jacobian[(i * 2 + row, col_base + col)] = j_point[(row, col)];
                }
            }
        }

        jacobian
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for BAProblem {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params.copy_from(params);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        Some(self.residuals_at(&self.params))
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        Some(self.jacobian_at(&self.params))
    }
}

impl MapRefiner for LmRefiner {
    fn refine(&self, problem: &RefinementProblem) -> Result<Refinement, RefineError> {
        let num_params = problem.num_parameters();
        let num_residuals = problem.num_residuals();
        if num_params == 0 || num_residuals == 0 || problem.fixed.len() != problem.poses.len() {
            return Err(RefineError::NoData);
        }
        if num_residuals < num_params {
            return Err(RefineError::Underdetermined {
                residuals: num_residuals,
                parameters: num_params,
            });
        }

        // Pose index -> pose parameter block
        let mut pose_param_idx = vec![None; problem.poses.len()];
        let mut num_pose_params = 0;
        for (i, fixed) in problem.fixed.iter().enumerate() {
            if !fixed {
                pose_param_idx[i] = Some(num_pose_params);
                num_pose_params += 1;
            }
        }

        let poses_cw: Vec<SE3> = problem.poses.iter().map(SE3::inverse).collect();

        let mut params = DVector::zeros(num_params);
        for (i, pose_cw) in poses_cw.iter().enumerate() {
            if let Some(idx) = pose_param_idx[i] {
                let (rot, trans) = se3_to_params(pose_cw);
                params.fixed_rows_mut::<3>(idx * 6).copy_from(&rot);
                params.fixed_rows_mut::<3>(idx * 6 + 3).copy_from(&trans);
            }
        }
        for (j, point) in problem.points.iter().enumerate() {
            params
                .fixed_rows_mut::<3>(num_pose_params * 6 + j * 3)
                .copy_from(point);
        }

        let mut observations = Vec::with_capacity(problem.observations.len());
        for obs in &problem.observations {
            if obs.pose_index >= problem.poses.len() || obs.point_index >= problem.points.len() {
                return Err(RefineError::NoData);
            }
            observations.push(BAObservation {
                pose_param_idx: pose_param_idx[obs.pose_index],
                fixed_pose_cw: poses_cw[obs.pose_index],
                point_param_idx: obs.point_index,
                observed: obs.normalized,
            });
        }

        let ba_problem = BAProblem {
            params,
            observations,
            num_pose_params,
            huber_threshold: self.config.huber_threshold,
        };

        let initial_cost = rms(&ba_problem.residuals_at(&ba_problem.params));

        let (solved, report) = LevenbergMarquardt::new()
            .with_patience(self.config.patience.max(1))
            .with_ftol(self.config.tolerance)
            .with_xtol(self.config.tolerance)
            .minimize(ba_problem);

        let final_params = solved.params();
        if final_params.iter().any(|v| !v.is_finite()) {
            return Err(RefineError::NonFinite);
        }
        let final_cost = rms(&solved.residuals_at(&final_params));

        if !report.termination.was_successful() && final_cost >= initial_cost {
            return Err(RefineError::Solver(format!("{:?}", report.termination)));
        }

        let poses = problem
            .poses
            .iter()
            .enumerate()
            .map(|(i, pose_wc)| match pose_param_idx[i] {
                Some(idx) => pose_from_params(&final_params, idx).inverse(),
                None => *pose_wc,
            })
            .collect();
        let points = (0..problem.points.len())
            .map(|j| solved.point(&final_params, j))
            .collect();

        Ok(Refinement {
            poses,
            points,
            initial_cost,
            final_cost,
            iterations: report.number_of_evaluations,
        })
    }
}

fn rms(residuals: &DVector<f64>) -> f64 {
    if residuals.is_empty() {
        return 0.0;
    }
    residuals.norm() / (residuals.len() as f64).sqrt()
}

/// Convert SE3 to axis-angle rotation + translation parameters.
fn se3_to_params(pose: &SE3) -> (Vector3<f64>, Vector3<f64>) {
    (pose.rotation.scaled_axis(), pose.translation)
}

/// Construct SE3 from axis-angle rotation + translation parameters.
fn se3_from_params(axis_angle: &Vector3<f64>, translation: &Vector3<f64>) -> SE3 {
    SE3 {
        rotation: nalgebra::UnitQuaternion::from_scaled_axis(*axis_angle),
        translation: *translation,
    }
}

fn pose_from_params(params: &DVector<f64>, idx: usize) -> SE3 {
    let base = idx * 6;
    let rot = Vector3::new(params[base], params[base + 1], params[base + 2]);
    let trans = Vector3::new(params[base + 3], params[base + 4], params[base + 5]);
    se3_from_params(&rot, &trans)
}
