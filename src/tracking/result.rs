//! Tracking results and diagnostics structures.
//!
//! These types describe what happened during processing of a single frame:
//! - high level tracking state (OK / LOST / etc.)
//! - pose estimate and its confidence
//! - correspondence counts
//! - timing information for profiling

use crate::geometry::SE3;
use crate::map::KeyframeId;
use crate::tracking::TrackingState;

/// Summary of tracking for a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingResult {
    pub state: TrackingState,
    pub pose: SE3,
    /// Id of the keyframe created from this frame, if any.
    pub keyframe_id: Option<KeyframeId>,
    pub metrics: TrackingMetrics,
    pub timing: TimingStats,
}

/// Scalar metrics useful for debugging tracking quality.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackingMetrics {
    pub n_features: usize,
    pub n_matches: usize,
    pub n_inliers: usize,
    pub confidence: f64,
    pub used_features: bool,
    /// Motion relative to the last keyframe.
    pub delta_translation_m: f64,
    pub delta_rotation_deg: f64,
}

/// Timing breakdown for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimingStats {
    pub total_ms: f64,
    pub odometry_ms: f64,
}
