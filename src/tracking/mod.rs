//! Tracking stage: processes raw RGB-D frames and outputs keyframes.
//!
//! - Feature extraction (Harris corners, binary descriptors)
//! - Frame-to-frame odometry (3D-3D RANSAC + motion model prior)
//! - Tracking state machine
//! - Keyframe gating

pub mod features;
pub mod frontend;
pub mod keyframe_gate;
pub mod motion_model;
pub mod odometry;
pub mod result;
pub mod state;

pub use features::{Feature, FeatureExtractor, HarrisBriefExtractor, HarrisConfig};
pub use frontend::{FrameOutput, Frontend, TrackingConfig};
pub use keyframe_gate::KeyframeGate;
pub use odometry::{FeatureOdometry, Odometry, OdometryConfig, OdometryEstimate};
pub use state::TrackingState;
