//! Shared fixtures for unit tests.

use std::collections::VecDeque;

use nalgebra::{Vector2, Vector3};

use crate::frame::{ColorImage, RawFrame};
use crate::geometry::SE3;
use crate::map::{Keyframe, KeyframeId};
use crate::tracking::{Odometry, OdometryEstimate};

/// Odometry that replays a fixed list of (pose, confidence) pairs.
///
/// Once the script is exhausted it keeps returning the prediction with
/// full confidence.
pub struct ScriptedOdometry {
    script: VecDeque<(SE3, f64)>,
}

impl ScriptedOdometry {
    pub fn new(script: Vec<(SE3, f64)>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl Odometry for ScriptedOdometry {
    fn track(&mut self, _frame: &RawFrame, predicted: &SE3) -> OdometryEstimate {
        let (pose, confidence) = self.script.pop_front().unwrap_or((*predicted, 1.0));
        OdometryEstimate::from_prior(pose, confidence)
    }

    fn accept(&mut self, _pose: &SE3) {}

    fn reset(&mut self) {
        self.script.clear();
    }
}

/// Frame holding one point sampled at the centre of a small red image.
pub fn single_point_frame(timestamp: f64, point: [f32; 3]) -> RawFrame {
    RawFrame::new(
        timestamp,
        vec![Vector3::new(point[0], point[1], point[2])],
        vec![Vector2::new(0.5, 0.5)],
        ColorImage::filled(4, 4, [255, 0, 0]),
    )
}

/// Keyframe with `points` observed from `pose`, all sampled red.
pub fn keyframe_with_points(id: u64, pose: SE3, points: &[Vector3<f32>]) -> Keyframe {
    Keyframe {
        id: KeyframeId::new(id),
        timestamp: id as f64,
        pose,
        points: points.to_vec(),
        tex_coords: vec![Vector2::new(0.5, 0.5); points.len()],
        image: ColorImage::filled(4, 4, [255, 0, 0]),
    }
}
