//! Real-time dense mapping: RGB-D tracking, keyframe gating and surfel
//! fusion into a sparse voxel map.
//!
//! The [`PipelineManager`] wires a frontend (tracking) thread and a backend
//! (fusion and local refinement) thread around a shared [`VoxelMap`].

pub mod config;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod io;
pub mod map;
pub mod mapping;
pub mod optimizer;
pub mod system;
pub mod tracking;
#[cfg(feature = "viz")]
pub mod viz;

#[cfg(test)]
mod test_helpers;

pub use config::PipelineConfig;
pub use error::{ConfigError, MapError, PipelineError, RefineError};
pub use frame::{ColorImage, RawFrame};
pub use geometry::SE3;
pub use map::{Keyframe, KeyframeId, Surfel, VoxelMap};
pub use system::{LiveFrame, PipelineManager, PipelineStats, PresentationEvent};
pub use tracking::TrackingState;
