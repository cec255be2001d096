//! Velocity-based motion model for pose prediction.

use nalgebra::{UnitQuaternion, Vector3};

use crate::geometry::SE3;

/// Constant velocity motion model.
///
/// Predicts the next pose from the motion observed between the previous
/// two accepted poses. Velocities are expressed per frame.
#[derive(Debug, Clone)]
pub struct MotionModel {
    prev_pose: Option<SE3>,
    /// Translation per frame, world frame.
    velocity: Vector3<f64>,
    /// Rotation per frame, body frame.
    angular_velocity: UnitQuaternion<f64>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self {
            prev_pose: None,
            velocity: Vector3::zeros(),
            angular_velocity: UnitQuaternion::identity(),
        }
    }

    /// Update the model with a new accepted pose.
    pub fn update(&mut self, pose: &SE3) {
        if let Some(ref prev) = self.prev_pose {
            self.velocity = pose.translation - prev.translation;
            self.angular_velocity = prev.rotation.inverse() * pose.rotation;
        }
        self.prev_pose = Some(*pose);
    }

    /// Predict the next pose based on constant velocity assumption.
    pub fn predict(&self) -> Option<SE3> {
        self.prev_pose.as_ref().map(|prev| SE3 {
            rotation: prev.rotation * self.angular_velocity,
            translation: prev.translation + self.velocity,
        })
    }

    /// Keep the last pose but forget the velocity.
    pub fn stop(&mut self) {
        self.velocity = Vector3::zeros();
        self.angular_velocity = UnitQuaternion::identity();
    }

    pub fn reset(&mut self) {
        self.prev_pose = None;
        self.stop();
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.velocity
    }
}

impl Default for MotionModel {
    fn default() -> Self {
        Self::new()
    }
}
