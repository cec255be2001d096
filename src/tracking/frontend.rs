//! Frontend: turns raw frames into poses, keyframes and live previews.
//!
//! `process_new_frame` is a plain function over the frontend state so it
//! can be exercised without threads; `run` is the stage loop that feeds it
//! from the frame channel and forwards its outputs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::frame::RawFrame;
use crate::geometry::SE3;
use crate::map::{Keyframe, KeyframeId};
use crate::system::messages::{LiveFrame, PresentationEvent};
use crate::system::shared_state::{PipelineCounters, SharedState};

use super::keyframe_gate::KeyframeGate;
use super::motion_model::MotionModel;
use super::odometry::{FeatureOdometry, Odometry, OdometryConfig};
use super::result::{TimingStats, TrackingMetrics, TrackingResult};
use super::state::TrackingState;

/// Timeout for receiving frames. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Estimates below this confidence are rejected.
    pub min_confidence: f64,
    /// Consecutive rejected frames before RecentlyLost becomes Lost.
    pub max_lost_frames: usize,
    pub odometry: OdometryConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            max_lost_frames: 5,
            odometry: OdometryConfig::default(),
        }
    }
}

/// Everything produced by one call to [`Frontend::process_new_frame`].
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub live: LiveFrame,
    pub keyframe: Option<Keyframe>,
    pub result: TrackingResult,
}

/// Tracking stage.
pub struct Frontend {
    config: TrackingConfig,
    odometry: Box<dyn Odometry>,
    motion_model: MotionModel,
    gate: KeyframeGate,

    /// Current pose (T_wc). Only advanced by accepted estimates.
    pose: SE3,
    state: TrackingState,
    /// Number of consecutive rejected frames.
    lost_frames: usize,
    frame_count: u64,
    next_keyframe_id: u64,
}

impl Frontend {
    /// Frontend with the default feature odometry.
    pub fn new(config: TrackingConfig, gate: KeyframeGate) -> Self {
        let odometry = Box::new(FeatureOdometry::new(config.odometry.clone()));
        Self::with_odometry(config, gate, odometry)
    }

    pub fn with_odometry(
        config: TrackingConfig,
        gate: KeyframeGate,
        odometry: Box<dyn Odometry>,
    ) -> Self {
        Self {
            config,
            odometry,
            motion_model: MotionModel::new(),
            gate,
            pose: SE3::identity(),
            state: TrackingState::NotInitialized,
            lost_frames: 0,
            frame_count: 0,
            next_keyframe_id: 0,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn pose(&self) -> &SE3 {
        &self.pose
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Number of keyframes emitted so far.
    pub fn keyframe_count(&self) -> u64 {
        self.next_keyframe_id
    }

    /// Track one frame.
    ///
    /// Always returns a live preview. A keyframe is returned only when
    /// tracking is OK and the gate passes.
    pub fn process_new_frame(&mut self, frame: RawFrame) -> FrameOutput {
        let t_start = Instant::now();
        self.frame_count += 1;

        // Step 1: Predict with the motion model
        let predicted = self.motion_model.predict().unwrap_or(self.pose);

        // Step 2: Estimate pose
        let t_odometry = Instant::now();
        let estimate = self.odometry.track(&frame, &predicted);
        let odometry_ms = t_odometry.elapsed().as_secs_f64() * 1000.0;

        // Step 3: Accept or reject, update the state machine
        let accepted = estimate.confidence >= self.config.min_confidence;
        self.update_state(accepted);
        if accepted {
            self.pose = estimate.pose;
            self.motion_model.update(&self.pose);
            self.odometry.accept(&self.pose);
        }

        // Step 4: Keyframe gating
        let delta = self.gate.delta(&self.pose).unwrap_or_default();
        let keyframe = if accepted && self.state == TrackingState::Ok {
            self.maybe_create_keyframe(&frame)
        } else {
            None
        };

        if !accepted {
            debug!(
                "[Frontend] frame={} rejected: confidence {:.2} < {:.2} state={}",
                self.frame_count, estimate.confidence, self.config.min_confidence, self.state
            );
        }

        let result = TrackingResult {
            state: self.state,
            pose: self.pose,
            keyframe_id: keyframe.as_ref().map(|kf| kf.id),
            metrics: TrackingMetrics {
                n_features: estimate.num_features,
                n_matches: estimate.num_matches,
                n_inliers: estimate.num_inliers,
                confidence: estimate.confidence,
                used_features: estimate.used_features,
                delta_translation_m: delta.translation,
                delta_rotation_deg: delta.rotation.to_degrees(),
            },
            timing: TimingStats {
                total_ms: t_start.elapsed().as_secs_f64() * 1000.0,
                odometry_ms,
            },
        };

        // Step 5: Live preview (takes ownership of the frame data)
        let live = LiveFrame {
            timestamp: frame.timestamp,
            pose: self.pose,
            state: self.state,
            points: frame.points,
            tex_coords: frame.tex_coords,
            image: frame.image,
        };

        FrameOutput {
            live,
            keyframe,
            result,
        }
    }

    fn maybe_create_keyframe(&mut self, frame: &RawFrame) -> Option<Keyframe> {
        if !self.gate.check(&self.pose) {
            return None;
        }

        let id = KeyframeId::new(self.next_keyframe_id);
        self.next_keyframe_id += 1;

        debug!(
            "[Frontend] new {} at t={:.3} ({} points)",
            id,
            frame.timestamp,
            frame.points.len()
        );
        Some(Keyframe::from_frame(id, self.pose, frame))
    }

    fn update_state(&mut self, accepted: bool) {
        let previous = self.state;

        self.state = match self.state {
            TrackingState::NotInitialized => {
                if accepted {
                    TrackingState::Ok
                } else {
                    TrackingState::NotInitialized
                }
            }
            TrackingState::Ok => {
                if accepted {
                    self.lost_frames = 0;
                    TrackingState::Ok
                } else {
                    self.lost_frames = 1;
                    TrackingState::RecentlyLost
                }
            }
            TrackingState::RecentlyLost => {
                if accepted {
                    self.lost_frames = 0;
                    TrackingState::Ok
                } else {
                    self.lost_frames += 1;
                    if self.lost_frames > self.config.max_lost_frames {
                        // Velocity is stale by now; predict from the last good pose.
                        self.motion_model.stop();
                        TrackingState::Lost
                    } else {
                        TrackingState::RecentlyLost
                    }
                }
            }
            TrackingState::Lost => {
                if accepted {
                    self.lost_frames = 0;
                    TrackingState::Ok
                } else {
                    self.lost_frames += 1;
                    TrackingState::Lost
                }
            }
        };

        if previous != self.state {
            info!("[Frontend] tracking state {} -> {}", previous, self.state);
        }
    }

    /// Stage loop: receive frames until shutdown or the input closes.
    ///
    /// Returns the frontend so that its state survives a restart.
    pub fn run(
        mut self,
        frames: Receiver<RawFrame>,
        keyframes: Sender<Keyframe>,
        shared: Arc<SharedState>,
    ) -> Self {
        let counters = &shared.counters;
        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            match frames.recv_timeout(RECV_TIMEOUT) {
                Ok(frame) => {
                    PipelineCounters::incr(&counters.frames_received);
                    let output = self.process_new_frame(frame);

                    if output.result.state.is_degraded() {
                        PipelineCounters::incr(&counters.frames_degraded);
                    } else if output.result.state == TrackingState::Ok {
                        PipelineCounters::incr(&counters.frames_tracked);
                    }

                    shared.publish(PresentationEvent::Live(output.live));

                    if let Some(keyframe) = output.keyframe {
                        if keyframes.send(keyframe).is_err() {
                            warn!("[Frontend] backend channel closed, stopping");
                            break;
                        }
                        PipelineCounters::incr(&counters.keyframes_emitted);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(
            "[Frontend] exiting after {} frames, {} keyframes",
            self.frame_count, self.next_keyframe_id
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedOdometry, single_point_frame};
    use nalgebra::{UnitQuaternion, Vector3};

    fn frontend_with_script(poses: Vec<(SE3, f64)>, t: f64, r: f64) -> Frontend {
        Frontend::with_odometry(
            TrackingConfig::default(),
            KeyframeGate::new(t, r),
            Box::new(ScriptedOdometry::new(poses)),
        )
    }

    fn at_x(x: f64) -> SE3 {
        SE3::from_translation(Vector3::new(x, 0.0, 0.0))
    }

    #[test]
    fn test_gating_sequence_below_threshold_then_above() {
        let mut poses: Vec<_> = (0..6).map(|i| (at_x(i as f64 * 0.01), 1.0)).collect();
        poses.push((at_x(0.2), 1.0));
        poses.push((at_x(0.205), 1.0));
        let mut frontend = frontend_with_script(poses, 0.1, 0.5);

        let mut keyframe_frames = Vec::new();
        for i in 0..8 {
            let out = frontend.process_new_frame(single_point_frame(i as f64, [0.0, 0.0, 1.0]));
            if out.keyframe.is_some() {
                keyframe_frames.push(i);
            }
        }

        assert_eq!(keyframe_frames, vec![0, 6]);
        assert_eq!(frontend.keyframe_count(), 2);
    }

    #[test]
    fn test_live_frame_always_emitted() {
        let poses = vec![(SE3::identity(), 1.0); 3];
        let mut frontend = frontend_with_script(poses, 1.0, 1.0);

        for i in 0..3 {
            let out = frontend.process_new_frame(single_point_frame(i as f64, [1.0, 2.0, 3.0]));
            assert_eq!(out.live.timestamp, i as f64);
            assert_eq!(out.live.points, vec![Vector3::new(1.0, 2.0, 3.0)]);
            assert_eq!(out.keyframe.is_some(), i == 0);
        }
    }

    #[test]
    fn test_keyframe_ids_monotonic() {
        let poses = (0..4).map(|i| (at_x(i as f64), 1.0)).collect();
        let mut frontend = frontend_with_script(poses, 0.0, 0.0);

        let ids: Vec<_> = (0..4)
            .filter_map(|i| {
                frontend
                    .process_new_frame(single_point_frame(i as f64, [0.0, 0.0, 1.0]))
                    .keyframe
                    .map(|kf| kf.id.0)
            })
            .collect();

        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_low_confidence_degrades_and_suppresses_keyframes() {
        let bad = SE3::new(UnitQuaternion::from_euler_angles(0.0, 1.0, 0.0), at_x(5.0).translation);
        let mut script = vec![(SE3::identity(), 1.0)];
        script.extend(std::iter::repeat((bad, 0.1)).take(7));
        script.push((at_x(0.5), 0.9));
        let mut frontend = frontend_with_script(script, 0.0, 0.0);

        let first = frontend.process_new_frame(single_point_frame(0.0, [0.0, 0.0, 1.0]));
        assert!(first.keyframe.is_some());

        let mut states = Vec::new();
        for i in 1..8 {
            let out = frontend.process_new_frame(single_point_frame(i as f64, [0.0, 0.0, 1.0]));
            assert!(out.keyframe.is_none());
            // Pose is held at the last good estimate.
            assert_eq!(out.live.pose, SE3::identity());
            states.push(out.result.state);
        }
        assert_eq!(states[0], TrackingState::RecentlyLost);
        assert_eq!(states[6], TrackingState::Lost);

        let recovered = frontend.process_new_frame(single_point_frame(8.0, [0.0, 0.0, 1.0]));
        assert_eq!(recovered.result.state, TrackingState::Ok);
        assert!(recovered.keyframe.is_some());
        assert_eq!(recovered.live.pose, at_x(0.5));
    }

    #[test]
    fn test_default_odometry_tracks_static_single_point() {
        let mut frontend = Frontend::new(TrackingConfig::default(), KeyframeGate::new(0.0, 0.0));

        for i in 0..3 {
            let out = frontend.process_new_frame(single_point_frame(i as f64, [1.0, 1.0, 1.0]));
            assert_eq!(out.result.state, TrackingState::Ok);
            assert!(out.keyframe.is_some());
            assert_eq!(out.result.metrics.confidence, 1.0);
        }
    }
}
