//! Pipeline orchestration and thread management.
//!
//! [`PipelineManager`] owns the voxel map, spawns the frontend and backend
//! threads and connects them with channels. [`SharedState`] carries the
//! shutdown flag, presentation target and counters between them.

pub mod messages;
pub mod pipeline;
pub mod shared_state;

pub use messages::{LiveFrame, PresentationEvent};
pub use pipeline::PipelineManager;
pub use shared_state::{PipelineStats, SharedState};
