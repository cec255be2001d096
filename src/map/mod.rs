//! Dense map: keyframes and the surfel voxel grid they are fused into.

pub mod keyframe;
pub mod surfel;
pub mod voxel_map;

pub use keyframe::{Keyframe, KeyframeId};
pub use surfel::{Surfel, SurfelParams};
pub(crate) use voxel_map::VoxelIndex;
pub use voxel_map::{FusionStats, VoxelMap};
