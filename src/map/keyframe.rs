//! Keyframe: a pose-stamped snapshot of a sensor frame.

use nalgebra::{Vector2, Vector3};

use crate::frame::{ColorImage, RawFrame};
use crate::geometry::SE3;

/// Unique identifier for a Keyframe.
///
/// Assigned sequentially by the frontend when a frame passes the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyframeId(pub u64);

impl KeyframeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// A frame retained for fusion.
///
/// Ownership moves from the frontend to the backend through the keyframe
/// channel; the backend drops it once fused.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyframe {
    pub id: KeyframeId,
    /// Seconds.
    pub timestamp: f64,
    /// Camera-to-world transform (T_wc).
    pub pose: SE3,
    /// Points in camera coordinates.
    pub points: Vec<Vector3<f32>>,
    /// `tex_coords[i]` locates `points[i]` in `image`.
    pub tex_coords: Vec<Vector2<f32>>,
    pub image: ColorImage,
}

impl Keyframe {
    /// Snapshot `frame` at `pose`. The frame data is copied.
    pub fn from_frame(id: KeyframeId, pose: SE3, frame: &RawFrame) -> Self {
        Self {
            id,
            timestamp: frame.timestamp,
            pose,
            points: frame.points.clone(),
            tex_coords: frame.tex_coords.clone(),
            image: frame.image.clone(),
        }
    }

    /// Camera center in world coordinates.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_id_display_and_order() {
        let a = KeyframeId::new(3);
        let b = KeyframeId::new(4);

        assert_eq!(format!("{}", a), "KF3");
        assert!(a < b);
    }

    #[test]
    fn test_from_frame_copies_data() {
        let frame = RawFrame::new(
            1.5,
            vec![Vector3::new(0.0, 0.0, 1.0)],
            vec![Vector2::new(0.5, 0.5)],
            ColorImage::filled(2, 2, [1, 2, 3]),
        );
        let pose = SE3::from_translation(Vector3::new(1.0, 0.0, 0.0));
        let kf = Keyframe::from_frame(KeyframeId::new(0), pose, &frame);

        assert_eq!(kf.timestamp, 1.5);
        assert_eq!(kf.points, frame.points);
        assert_eq!(kf.image, frame.image);
        assert_eq!(kf.camera_center(), Vector3::new(1.0, 0.0, 0.0));
    }
}
