//! Surfel: the fused state of one voxel cell.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Tunables for surfel confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfelParams {
    /// Confidence of a freshly created surfel.
    pub initial_confidence: f64,
    /// Confidence gained per additional observation (clamped at 1.0).
    pub confidence_step: f64,
}

impl Default for SurfelParams {
    fn default() -> Self {
        Self {
            initial_confidence: 0.1,
            confidence_step: 0.1,
        }
    }
}

/// One observation landing in a voxel cell, already in world coordinates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SurfelSample {
    pub position: Vector3<f64>,
    pub normal: Vector3<f64>,
    pub color: Vector3<f32>,
    pub timestamp: f64,
}

/// Surface element.
///
/// Invariants for every surfel held by a map:
/// `update_count >= 1`, `confidence` in [0, 1], `normal` unit length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Surfel {
    /// Running average of the observed world positions.
    pub position: Vector3<f64>,
    /// Running average of camera-to-point directions, renormalized.
    pub normal: Vector3<f64>,
    /// Running average RGB in [0, 1].
    pub color: Vector3<f32>,
    /// Spread estimate in meters.
    pub radius: f64,
    pub confidence: f64,
    pub last_update_time: f64,
    /// Number of fused observations.
    pub update_count: u32,
}

impl Surfel {
    pub(crate) fn from_sample(sample: &SurfelSample, radius: f64, params: &SurfelParams) -> Self {
        Self {
            position: sample.position,
            normal: sample.normal,
            color: sample.color,
            radius,
            confidence: params.initial_confidence.clamp(0.0, 1.0),
            last_update_time: sample.timestamp,
            update_count: 1,
        }
    }

    /// Fold one more observation into the running averages.
    ///
    /// `new = (old * n + sample) / (n + 1)` for position, normal and color.
    /// `radius_bounds` are the (min, max) spread for the cell size.
    pub(crate) fn integrate(
        &mut self,
        sample: &SurfelSample,
        params: &SurfelParams,
        radius_bounds: (f64, f64),
    ) {
        let n = f64::from(self.update_count);
        let n1 = n + 1.0;

        let spread = (sample.position - self.position).norm();
        self.radius = ((self.radius * n + spread) / n1).clamp(radius_bounds.0, radius_bounds.1);

        self.position = (self.position * n + sample.position) / n1;

        let averaged = (self.normal * n + sample.normal) / n1;
        self.normal = averaged.try_normalize(1e-9).unwrap_or(sample.normal);

        let nf = n as f32;
        self.color = (self.color * nf + sample.color) / (nf + 1.0);

        self.update_count = self.update_count.saturating_add(1);
        self.confidence = (self.confidence + params.confidence_step).clamp(0.0, 1.0);
        self.last_update_time = sample.timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(position: Vector3<f64>, normal: Vector3<f64>, t: f64) -> SurfelSample {
        SurfelSample {
            position,
            normal,
            color: Vector3::new(0.2, 0.4, 0.6),
            timestamp: t,
        }
    }

    #[test]
    fn test_integrate_running_average() {
        let params = SurfelParams::default();
        let mut s = Surfel::from_sample(
            &sample(Vector3::new(0.0, 0.0, 0.0), Vector3::z(), 0.0),
            0.025,
            &params,
        );
        s.integrate(
            &sample(Vector3::new(0.02, 0.0, 0.0), Vector3::z(), 1.0),
            &params,
            (0.025, 0.1),
        );
        s.integrate(
            &sample(Vector3::new(0.04, 0.0, 0.0), Vector3::z(), 2.0),
            &params,
            (0.025, 0.1),
        );

        assert_relative_eq!(s.position, Vector3::new(0.02, 0.0, 0.0), epsilon = 1e-12);
        assert_eq!(s.update_count, 3);
        assert_relative_eq!(s.confidence, 0.3, epsilon = 1e-12);
        assert_eq!(s.last_update_time, 2.0);
    }

    #[test]
    fn test_opposite_normals_keep_sample() {
        let params = SurfelParams::default();
        let mut s = Surfel::from_sample(&sample(Vector3::zeros(), Vector3::x(), 0.0), 0.1, &params);
        s.integrate(&sample(Vector3::zeros(), -Vector3::x(), 1.0), &params, (0.1, 0.2));

        assert_relative_eq!(s.normal.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(s.normal, -Vector3::x(), epsilon = 1e-12);
    }

    #[test]
    fn test_confidence_clamped() {
        let params = SurfelParams {
            initial_confidence: 0.9,
            confidence_step: 0.3,
        };
        let mut s = Surfel::from_sample(&sample(Vector3::zeros(), Vector3::y(), 0.0), 0.1, &params);
        s.integrate(&sample(Vector3::zeros(), Vector3::y(), 1.0), &params, (0.1, 0.2));

        assert_eq!(s.confidence, 1.0);
    }
}
