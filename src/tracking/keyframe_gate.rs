//! Keyframe gating: decides which tracked frames become keyframes.

use crate::geometry::SE3;

/// Motion-based keyframe gate.
///
/// The first accepted frame always passes. After that a frame passes when
/// its pose is at least `translation_threshold` meters OR
/// `rotation_threshold` radians away from the last emitted keyframe.
/// Thresholds of zero therefore let every tracked frame through.
#[derive(Debug, Clone)]
pub struct KeyframeGate {
    translation_threshold: f64,
    rotation_threshold: f64,
    last_keyframe_pose: Option<SE3>,
}

/// Distance between a candidate pose and the last keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PoseDelta {
    pub translation: f64,
    pub rotation: f64,
}

impl KeyframeGate {
    pub fn new(translation_threshold: f64, rotation_threshold: f64) -> Self {
        Self {
            translation_threshold,
            rotation_threshold,
            last_keyframe_pose: None,
        }
    }

    /// Motion of `pose` since the last keyframe, `None` before the first one.
    pub fn delta(&self, pose: &SE3) -> Option<PoseDelta> {
        self.last_keyframe_pose.as_ref().map(|kf| PoseDelta {
            translation: kf.translation_distance(pose),
            rotation: kf.rotation_angle_to(pose),
        })
    }

    /// Decide whether `pose` should become a keyframe.
    pub fn should_emit(&self, pose: &SE3) -> bool {
        match self.delta(pose) {
            None => true,
            Some(d) => {
                d.translation >= self.translation_threshold || d.rotation >= self.rotation_threshold
            }
        }
    }

    /// Record that a keyframe was emitted at `pose`.
    pub fn record(&mut self, pose: &SE3) {
        self.last_keyframe_pose = Some(*pose);
    }

    /// `should_emit` + `record` in one step.
    pub fn check(&mut self, pose: &SE3) -> bool {
        let emit = self.should_emit(pose);
        if emit {
            self.record(pose);
        }
        emit
    }

    pub fn last_keyframe_pose(&self) -> Option<&SE3> {
        self.last_keyframe_pose.as_ref()
    }

    pub fn reset(&mut self) {
        self.last_keyframe_pose = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{UnitQuaternion, Vector3};

    fn at_x(x: f64) -> SE3 {
        SE3::from_translation(Vector3::new(x, 0.0, 0.0))
    }

    #[test]
    fn test_first_frame_always_passes() {
        let mut gate = KeyframeGate::new(10.0, 10.0);
        assert!(gate.check(&SE3::identity()));
        assert!(!gate.check(&SE3::identity()));
    }

    #[test]
    fn test_small_steps_never_accumulate_past_last_keyframe() {
        let mut gate = KeyframeGate::new(0.1, 0.2);
        assert!(gate.check(&at_x(0.0)));

        let mut emitted = 0;
        for i in 1..=9 {
            if gate.check(&at_x(i as f64 * 0.01)) {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 0);

        // 0.15 m away from the first keyframe: exactly one more.
        assert!(gate.check(&at_x(0.15)));
        assert!(!gate.check(&at_x(0.16)));
    }

    #[test]
    fn test_rotation_alone_triggers() {
        let mut gate = KeyframeGate::new(1.0, 0.1);
        gate.check(&SE3::identity());

        let small = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.0, 0.05), Vector3::zeros());
        let large = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.0, 0.15), Vector3::zeros());
        assert!(!gate.check(&small));
        assert!(gate.check(&large));
    }

    #[test]
    fn test_zero_thresholds_pass_everything() {
        let mut gate = KeyframeGate::new(0.0, 0.0);
        for _ in 0..3 {
            assert!(gate.check(&SE3::identity()));
        }
    }
}
