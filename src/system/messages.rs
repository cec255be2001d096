//! Inter-thread message types.
//!
//! Keyframes travel from the frontend to the backend by value on their own
//! channel. Everything meant for the presentation layer is a
//! [`PresentationEvent`].

use nalgebra::{Matrix4, Vector2, Vector3};

use crate::frame::ColorImage;
use crate::geometry::SE3;
use crate::tracking::TrackingState;

/// Low-latency preview of the frame the frontend just processed.
///
/// Published for every frame, independent of keyframe gating and fusion.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveFrame {
    pub timestamp: f64,
    /// Latest accepted camera-to-world pose. While tracking is degraded this
    /// stays at the last good pose.
    pub pose: SE3,
    pub state: TrackingState,
    /// Points in camera coordinates.
    pub points: Vec<Vector3<f32>>,
    pub tex_coords: Vec<Vector2<f32>>,
    pub image: ColorImage,
}

impl LiveFrame {
    /// Pose as a 4x4 rigid transform.
    pub fn pose_matrix(&self) -> Matrix4<f64> {
        self.pose.to_matrix()
    }
}

/// Messages delivered to the presentation target.
#[derive(Debug, Clone, PartialEq)]
pub enum PresentationEvent {
    /// Frontend: latest pose and raw frame.
    Live(LiveFrame),
    /// Backend: the voxel map changed; re-query `VoxelMap::surfels`.
    MapUpdated,
}
