//! Contract between the backend and a local refinement solver.
//!
//! The backend extracts a [`RefinementProblem`] snapshot, hands it to a
//! [`MapRefiner`] without holding any locks, and applies the returned
//! [`Refinement`] afterwards.

use nalgebra::{Vector2, Vector3};

use crate::error::RefineError;
use crate::geometry::SE3;

/// One keyframe observing one point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    /// Index into `RefinementProblem::poses`.
    pub pose_index: usize,
    /// Index into `RefinementProblem::points`.
    pub point_index: usize,
    /// Observed normalized image coordinates (x/z, y/z) in the camera frame.
    pub normalized: Vector2<f64>,
}

/// Snapshot of a local window of poses and points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefinementProblem {
    /// Camera-to-world poses (T_wc).
    pub poses: Vec<SE3>,
    /// `fixed[i]` keeps `poses[i]` constant (gauge anchor).
    pub fixed: Vec<bool>,
    /// World positions.
    pub points: Vec<Vector3<f64>>,
    pub observations: Vec<Observation>,
}

impl RefinementProblem {
    pub fn num_free_poses(&self) -> usize {
        self.fixed.iter().filter(|f| !**f).count()
    }

    /// Number of scalar unknowns.
    pub fn num_parameters(&self) -> usize {
        self.num_free_poses() * 6 + self.points.len() * 3
    }

    /// Number of scalar residuals.
    pub fn num_residuals(&self) -> usize {
        self.observations.len() * 2
    }
}

/// Output of a refinement run. Same shape and order as the problem.
#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub poses: Vec<SE3>,
    pub points: Vec<Vector3<f64>>,
    /// RMS of the normalized reprojection error before and after.
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Solver iterations (or function evaluations).
    pub iterations: usize,
}

/// Joint pose / point refinement capability.
///
/// Shared between the pipeline manager and the backend it builds.
pub trait MapRefiner: Send + Sync {
    fn refine(&self, problem: &RefinementProblem) -> Result<Refinement, RefineError>;
}

/// RMS normalized reprojection error of `problem` at its current values.
pub fn reprojection_rms(problem: &RefinementProblem) -> f64 {
    if problem.observations.is_empty() {
        return 0.0;
    }
    let inverses: Vec<SE3> = problem.poses.iter().map(SE3::inverse).collect();
    let sum_sq: f64 = problem
        .observations
        .iter()
        .map(|obs| {
            let p_cam = inverses[obs.pose_index].transform_point(&problem.points[obs.point_index]);
            if p_cam.z <= 1e-6 {
                return 1.0;
            }
            (obs.normalized - Vector2::new(p_cam.x / p_cam.z, p_cam.y / p_cam.z)).norm_squared()
        })
        .sum();
    (sum_sq / problem.observations.len() as f64).sqrt()
}
