//! Local refinement of keyframe poses and surfel positions.
//!
//! - [`MapRefiner`]: the capability the backend calls into
//! - [`LmRefiner`]: Levenberg-Marquardt bundle adjustment over normalized
//!   reprojection error

pub mod local_ba_lm;
pub mod refiner;

pub use local_ba_lm::{LmRefiner, LocalBAConfigLM};
pub use refiner::{reprojection_rms, MapRefiner, Observation, Refinement, RefinementProblem};
