//! SE3: 6-DOF rigid body transformation (rotation + translation).
//!
//! Poses are stored as camera-to-world (T_wc) throughout the pipeline:
//! `p_world = pose.transform_point(&p_camera)`.

use std::ops::Mul;

use nalgebra::{Matrix4, UnitQuaternion, Vector3};

/// Rigid body transformation: p' = R * p + t.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Homogeneous 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Whether this is a valid rigid transform.
    ///
    /// A `UnitQuaternion` built with `new_unchecked` can carry a non-unit
    /// norm, which would encode a scaled rotation.
    pub fn is_rigid(&self, tolerance: f64) -> bool {
        let q = self.rotation.quaternion();
        q.coords.iter().all(|v| v.is_finite())
            && self.translation.iter().all(|v| v.is_finite())
            && (q.norm() - 1.0).abs() <= tolerance
    }

    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// Apply this transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Apply only the rotation part to a vector.
    pub fn rotate_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * v
    }

    /// Camera optical axis (+Z of the local frame) expressed in the parent frame.
    pub fn forward(&self) -> Vector3<f64> {
        self.rotation * Vector3::z()
    }

    /// Euclidean distance between the two translations.
    pub fn translation_distance(&self, other: &SE3) -> f64 {
        (self.translation - other.translation).norm()
    }

    /// Angle (radians) of the relative rotation between the two poses.
    pub fn rotation_angle_to(&self, other: &SE3) -> f64 {
        self.rotation.angle_to(&other.rotation)
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

impl<'a> Mul<&'a SE3> for &'a SE3 {
    type Output = SE3;

    fn mul(self, rhs: &'a SE3) -> SE3 {
        *self * *rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Quaternion;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let pose = sample_pose();
        let id = pose * pose.inverse();

        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_is_rigid_detects_unnormalized_quaternion() {
        let pose = SE3::new(
            UnitQuaternion::new_unchecked(Quaternion::new(2.0, 0.0, 0.0, 0.0)),
            Vector3::zeros(),
        );
        assert!(!pose.is_rigid(1e-6));
        assert!(sample_pose().is_rigid(1e-6));
    }

    #[test]
    fn test_transform_point_matches_matrix() {
        let pose = sample_pose();
        let p = Vector3::new(0.3, 0.4, 2.0);
        let h = pose.to_matrix() * p.push(1.0);

        assert_relative_eq!(pose.transform_point(&p), h.xyz(), epsilon = 1e-12);
    }
}
