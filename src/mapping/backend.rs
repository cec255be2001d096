//! Backend: fuses keyframes into the voxel map and periodically refines
//! the most recent covisible window.
//!
//! Processing of one keyframe:
//! 1. Fuse into the voxel map (rejected keyframes stop here)
//! 2. Record a bounded history entry with subsampled voxel observations
//! 3. Every `optimization_interval` keyframes, local refinement in three
//!    phases: collect (read lock), solve (no lock), apply (write lock)

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use nalgebra::{Vector2, Vector3};
use tracing::{debug, error, info, warn};

use crate::error::{MapError, RefineError};
use crate::geometry::SE3;
use crate::map::{FusionStats, Keyframe, KeyframeId, VoxelIndex, VoxelMap};
use crate::optimizer::{MapRefiner, Observation, RefinementProblem};
use crate::system::messages::PresentationEvent;
use crate::system::shared_state::{PipelineCounters, SharedState};

/// Timeout for receiving keyframes. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Queue length above which the backend reports that it is falling behind.
const BACKLOG_HIGH_WATER: usize = 32;

/// History entries kept per window slot.
const HISTORY_PER_WINDOW_SLOT: usize = 4;

/// Minimum depth for an observation to enter a refinement problem.
const MIN_OBSERVATION_DEPTH: f64 = 1e-3;

/// Backend settings derived from the pipeline configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendConfig {
    /// Keyframes per refinement window. 0 or 1 disables refinement.
    pub optimization_window_size: usize,
    /// Run refinement every this many fused keyframes.
    pub optimization_interval: usize,
    /// Observations retained per keyframe for refinement.
    pub max_observations_per_keyframe: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            optimization_window_size: 5,
            optimization_interval: 5,
            max_observations_per_keyframe: 64,
        }
    }
}

/// What the refinement step did for one keyframe.
#[derive(Debug, Clone, PartialEq)]
pub enum RefinementOutcome {
    /// Not due this keyframe, disabled, or no refiner installed.
    NotScheduled,
    /// The refiner (or problem collection) failed; the map is untouched.
    Failed(RefineError),
    /// The refiner made things worse; the result was thrown away.
    Discarded { initial_cost: f64, final_cost: f64 },
    Applied {
        keyframes: usize,
        points: usize,
        initial_cost: f64,
        final_cost: f64,
    },
}

/// Result of [`Backend::process_new_keyframe`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReport {
    pub keyframe_id: KeyframeId,
    pub fusion: FusionStats,
    pub refinement: RefinementOutcome,
}

/// What the backend remembers about a fused keyframe.
#[derive(Debug, Clone)]
struct KeyframeRecord {
    id: KeyframeId,
    /// T_wc, updated by refinement.
    pose: SE3,
    /// (cell, point in camera coordinates), at most one per cell.
    observations: Vec<(VoxelIndex, Vector3<f64>)>,
}

/// Refinement window extracted from the history.
struct WindowProblem {
    /// History positions of the window keyframes, oldest first.
    records: Vec<usize>,
    /// Cell of each problem point.
    voxels: Vec<VoxelIndex>,
    problem: RefinementProblem,
}

/// Mapping stage.
pub struct Backend {
    map: Arc<VoxelMap>,
    config: BackendConfig,
    refiner: Option<Arc<dyn MapRefiner>>,
    history: VecDeque<KeyframeRecord>,
    keyframes_fused: u64,
}

impl Backend {
    pub fn new(
        map: Arc<VoxelMap>,
        config: BackendConfig,
        refiner: Option<Arc<dyn MapRefiner>>,
    ) -> Self {
        let capacity = (config.optimization_window_size * HISTORY_PER_WINDOW_SLOT).max(1);
        Self {
            map,
            config,
            refiner,
            history: VecDeque::with_capacity(capacity),
            keyframes_fused: 0,
        }
    }

    pub fn map(&self) -> &Arc<VoxelMap> {
        &self.map
    }

    pub fn keyframes_fused(&self) -> u64 {
        self.keyframes_fused
    }

    pub fn set_refiner(&mut self, refiner: Option<Arc<dyn MapRefiner>>) {
        self.refiner = refiner;
    }

    /// Fuse `keyframe` and run refinement when it is due.
    ///
    /// Only fusion errors are returned. Refinement failures are reported in
    /// [`BackendReport::refinement`].
    pub fn process_new_keyframe(&mut self, keyframe: Keyframe) -> Result<BackendReport, MapError> {
        let fusion = self.map.fuse(&keyframe)?;
        self.keyframes_fused += 1;

        self.record(&keyframe);

        let refinement = if self.refinement_due() {
            self.local_refinement(keyframe.id)
        } else {
            RefinementOutcome::NotScheduled
        };

        Ok(BackendReport {
            keyframe_id: keyframe.id,
            fusion,
            refinement,
        })
    }

    fn refinement_due(&self) -> bool {
        self.refiner.is_some()
            && self.config.optimization_window_size >= 2
            && self.keyframes_fused % self.config.optimization_interval.max(1) as u64 == 0
    }

    fn history_capacity(&self) -> usize {
        (self.config.optimization_window_size * HISTORY_PER_WINDOW_SLOT).max(1)
    }

    /// Append a history entry with evenly subsampled observations.
    fn record(&mut self, keyframe: &Keyframe) {
        let max_obs = self.config.max_observations_per_keyframe.max(1);
        let stride = keyframe.points.len().div_ceil(max_obs).max(1);

        let mut seen = HashSet::new();
        let mut observations = Vec::with_capacity(max_obs.min(keyframe.points.len()));
        for p in keyframe.points.iter().step_by(stride) {
            let local = p.cast::<f64>();
            if !local.iter().all(|v| v.is_finite()) {
                continue;
            }
            let index = self.map.index_of(&keyframe.pose.transform_point(&local));
            if seen.insert(index) {
                observations.push((index, local));
            }
        }

        if self.history.len() == self.history_capacity() {
            self.history.pop_front();
        }
        self.history.push_back(KeyframeRecord {
            id: keyframe.id,
            pose: keyframe.pose,
            observations,
        });
    }

    fn local_refinement(&mut self, kf_id: KeyframeId) -> RefinementOutcome {
        let Some(refiner) = self.refiner.as_ref() else {
            return RefinementOutcome::NotScheduled;
        };

        // PHASE 1: COLLECT (read lock inside positions_of)
        let window = match self.collect_window() {
            Ok(w) => w,
            Err(e) => {
                warn!("[LocalBA-LM] {} skipped: {}", kf_id, e);
                return RefinementOutcome::Failed(e);
            }
        };

        // PHASE 2: SOLVE (no lock held)
        let refinement = match refiner.refine(&window.problem) {
            Ok(r) => r,
            Err(e) => {
                warn!("[LocalBA-LM] {} skipped: {}", kf_id, e);
                return RefinementOutcome::Failed(e);
            }
        };

        if refinement.final_cost > refinement.initial_cost
            || refinement.poses.len() != window.records.len()
            || refinement.points.len() != window.voxels.len()
        {
            warn!(
                "[LocalBA-LM] {} discarded: cost {:.6} -> {:.6}",
                kf_id, refinement.initial_cost, refinement.final_cost
            );
            return RefinementOutcome::Discarded {
                initial_cost: refinement.initial_cost,
                final_cost: refinement.final_cost,
            };
        }

        // PHASE 3: APPLY (write lock inside apply_corrections)
        for (&slot, pose) in window.records.iter().zip(&refinement.poses) {
            if let Some(record) = self.history.get_mut(slot) {
                record.pose = *pose;
            }
        }
        let corrections: Vec<(VoxelIndex, Vector3<f64>)> = window
            .voxels
            .iter()
            .copied()
            .zip(refinement.points.iter().copied())
            .collect();
        let updated = self.map.apply_corrections(&corrections);

        debug!(
            "[LocalBA-LM] {} kfs={} points={} iters={} cost: {:.6} -> {:.6} (updated={})",
            kf_id,
            window.records.len(),
            window.voxels.len(),
            refinement.iterations,
            refinement.initial_cost,
            refinement.final_cost,
            updated
        );

        RefinementOutcome::Applied {
            keyframes: window.records.len(),
            points: updated,
            initial_cost: refinement.initial_cost,
            final_cost: refinement.final_cost,
        }
    }

    /// Newest keyframe plus its most recent covisible predecessors.
    fn collect_window(&self) -> Result<WindowProblem, RefineError> {
        let newest_slot = self.history.len().checked_sub(1).ok_or(RefineError::NoData)?;
        let newest = &self.history[newest_slot];
        let newest_cells: HashSet<VoxelIndex> =
            newest.observations.iter().map(|(index, _)| *index).collect();

        let mut records: Vec<usize> = (0..newest_slot)
            .rev()
            .filter(|&slot| {
                self.history[slot]
                    .observations
                    .iter()
                    .any(|(index, _)| newest_cells.contains(index))
            })
            .take(self.config.optimization_window_size.saturating_sub(1))
            .collect();
        records.reverse();
        records.push(newest_slot);

        if records.len() < 2 {
            return Err(RefineError::NoData);
        }

        // Cells seen by at least two window keyframes.
        let mut seen_by: HashMap<VoxelIndex, usize> = HashMap::new();
        for &slot in &records {
            for (index, _) in &self.history[slot].observations {
                *seen_by.entry(*index).or_insert(0) += 1;
            }
        }
        let mut candidates: Vec<VoxelIndex> = seen_by
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .map(|(index, _)| index)
            .collect();
        candidates.sort();

        let positions = self.map.positions_of(&candidates);
        let mut voxels = Vec::with_capacity(candidates.len());
        let mut points = Vec::with_capacity(candidates.len());
        let mut point_of: HashMap<VoxelIndex, usize> = HashMap::new();
        for (index, position) in candidates.into_iter().zip(positions) {
            if let Some(position) = position {
                point_of.insert(index, points.len());
                voxels.push(index);
                points.push(position);
            }
        }
        if points.is_empty() {
            return Err(RefineError::NoData);
        }

        let mut observations = Vec::new();
        for (pose_index, &slot) in records.iter().enumerate() {
            for (index, local) in &self.history[slot].observations {
                let Some(&point_index) = point_of.get(index) else {
                    continue;
                };
                if local.z <= MIN_OBSERVATION_DEPTH {
                    continue;
                }
                observations.push(Observation {
                    pose_index,
                    point_index,
                    normalized: Vector2::new(local.x / local.z, local.y / local.z),
                });
            }
        }

        let mut fixed = vec![false; records.len()];
        fixed[0] = true;

        let problem = RefinementProblem {
            poses: records.iter().map(|&slot| self.history[slot].pose).collect(),
            fixed,
            points,
            observations,
        };

        debug!(
            "[LocalBA-LM] window {:?} points={} observations={}",
            records.iter().map(|&slot| self.history[slot].id.0).collect::<Vec<_>>(),
            problem.points.len(),
            problem.observations.len()
        );

        Ok(WindowProblem {
            records,
            voxels,
            problem,
        })
    }

    /// Stage loop: receive keyframes until shutdown or the channel closes.
    ///
    /// Returns the backend so that its state survives a restart.
    pub fn run(mut self, keyframes: Receiver<Keyframe>, shared: Arc<SharedState>) -> Self {
        let counters = &shared.counters;
        let mut behind = false;
        loop {
            if shared.is_shutdown_requested() {
                break;
            }

            let backlog = keyframes.len();
            if backlog > BACKLOG_HIGH_WATER && !behind {
                warn!("[Backend] falling behind: {} keyframes queued", backlog);
                behind = true;
            } else if backlog <= BACKLOG_HIGH_WATER / 2 {
                behind = false;
            }

            match keyframes.recv_timeout(RECV_TIMEOUT) {
                Ok(keyframe) => {
                    let id = keyframe.id;
                    match self.process_new_keyframe(keyframe) {
                        Ok(report) => {
                            PipelineCounters::incr(&counters.keyframes_fused);
                            match report.refinement {
                                RefinementOutcome::Applied { .. } => {
                                    PipelineCounters::incr(&counters.optimizations_applied)
                                }
                                RefinementOutcome::Failed(_)
                                | RefinementOutcome::Discarded { .. } => {
                                    PipelineCounters::incr(&counters.optimizations_skipped)
                                }
                                RefinementOutcome::NotScheduled => {}
                            }
                            shared.publish(PresentationEvent::MapUpdated);
                        }
                        Err(e) => {
                            error!("[Backend] {} rejected: {}", id, e);
                            PipelineCounters::incr(&counters.keyframes_rejected);
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        info!(
            "[Backend] exiting after {} keyframes, {} surfels",
            self.keyframes_fused,
            self.map.len()
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{LmRefiner, Refinement};
    use crate::test_helpers::keyframe_with_points;
    use approx::assert_relative_eq;
    use nalgebra::{Quaternion, UnitQuaternion};
    use parking_lot::Mutex;

    /// Refiner that shifts every point and reports a fixed cost change.
    struct ShiftRefiner {
        shift: Vector3<f64>,
        final_cost: f64,
        seen: Arc<Mutex<Option<RefinementProblem>>>,
    }

    impl MapRefiner for ShiftRefiner {
        fn refine(&self, problem: &RefinementProblem) -> Result<Refinement, RefineError> {
            *self.seen.lock() = Some(problem.clone());
            Ok(Refinement {
                poses: problem.poses.clone(),
                points: problem.points.iter().map(|p| p + self.shift).collect(),
                initial_cost: 1.0,
                final_cost: self.final_cost,
                iterations: 1,
            })
        }
    }

    struct FailingRefiner;

    impl MapRefiner for FailingRefiner {
        fn refine(&self, _problem: &RefinementProblem) -> Result<Refinement, RefineError> {
            Err(RefineError::Solver("diverged".into()))
        }
    }

    fn points() -> Vec<Vector3<f32>> {
        vec![
            Vector3::new(0.1, 0.1, 1.1),
            Vector3::new(0.6, 0.1, 1.1),
            Vector3::new(0.1, 0.6, 1.6),
            Vector3::new(-0.4, 0.2, 2.1),
        ]
    }

    fn every_second(window: usize) -> BackendConfig {
        BackendConfig {
            optimization_window_size: window,
            optimization_interval: 2,
            max_observations_per_keyframe: 64,
        }
    }

    fn map() -> Arc<VoxelMap> {
        Arc::new(VoxelMap::new(0.5).unwrap())
    }

    #[test]
    fn test_refinement_applies_corrections() {
        let seen = Arc::new(Mutex::new(None));
        let refiner = ShiftRefiner {
            shift: Vector3::new(0.01, 0.0, 0.0),
            final_cost: 0.5,
            seen: Arc::clone(&seen),
        };
        let mut backend = Backend::new(map(), every_second(2), Some(Arc::new(refiner)));

        let first = backend
            .process_new_keyframe(keyframe_with_points(0, SE3::identity(), &points()))
            .unwrap();
        assert_eq!(first.refinement, RefinementOutcome::NotScheduled);

        let second = backend
            .process_new_keyframe(keyframe_with_points(1, SE3::identity(), &points()))
            .unwrap();
        assert_eq!(
            second.refinement,
            RefinementOutcome::Applied {
                keyframes: 2,
                points: 4,
                initial_cost: 1.0,
                final_cost: 0.5
            }
        );

        let surfel = backend.map().surfel_at(&Vector3::new(0.1, 0.1, 1.1)).unwrap();
        assert_relative_eq!(surfel.position, Vector3::new(0.11, 0.1, 1.1), epsilon = 1e-6);

        let problem = seen.lock().clone().unwrap();
        assert_eq!(problem.fixed, vec![true, false]);
        assert_eq!(problem.points.len(), 4);
        assert_eq!(problem.observations.len(), 8);
        let obs = problem
            .observations
            .iter()
            .find(|o| (problem.points[o.point_index] - Vector3::new(0.6, 0.1, 1.1)).norm() < 1e-6)
            .unwrap();
        assert_relative_eq!(obs.normalized, Vector2::new(0.6 / 1.1, 0.1 / 1.1), epsilon = 1e-6);
    }

    #[test]
    fn test_worse_refinement_is_discarded() {
        let refiner = ShiftRefiner {
            shift: Vector3::new(0.01, 0.0, 0.0),
            final_cost: 2.0,
            seen: Arc::new(Mutex::new(None)),
        };
        let mut backend = Backend::new(map(), every_second(2), Some(Arc::new(refiner)));
        backend
            .process_new_keyframe(keyframe_with_points(0, SE3::identity(), &points()))
            .unwrap();
        let report = backend
            .process_new_keyframe(keyframe_with_points(1, SE3::identity(), &points()))
            .unwrap();

        assert!(matches!(report.refinement, RefinementOutcome::Discarded { .. }));
        let surfel = backend.map().surfel_at(&Vector3::new(0.1, 0.1, 1.1)).unwrap();
        assert_relative_eq!(surfel.position, Vector3::new(0.1, 0.1, 1.1), epsilon = 1e-6);
    }

    #[test]
    fn test_refiner_failure_does_not_stop_fusion() {
        let mut backend = Backend::new(map(), every_second(3), Some(Arc::new(FailingRefiner)));
        for i in 0..4 {
            let report = backend
                .process_new_keyframe(keyframe_with_points(i, SE3::identity(), &points()))
                .unwrap();
            if i % 2 == 1 {
                assert_eq!(
                    report.refinement,
                    RefinementOutcome::Failed(RefineError::Solver("diverged".into()))
                );
            }
        }

        assert_eq!(backend.keyframes_fused(), 4);
        let surfel = backend.map().surfel_at(&Vector3::new(0.1, 0.1, 1.1)).unwrap();
        assert_eq!(surfel.update_count, 4);
    }

    #[test]
    fn test_no_refiner_or_small_window_never_refines() {
        let mut without = Backend::new(map(), every_second(5), None);
        let mut tiny_window = Backend::new(map(), every_second(0), Some(Arc::new(FailingRefiner)));
        for i in 0..6 {
            let kf = keyframe_with_points(i, SE3::identity(), &points());
            assert_eq!(
                without.process_new_keyframe(kf.clone()).unwrap().refinement,
                RefinementOutcome::NotScheduled
            );
            assert_eq!(
                tiny_window.process_new_keyframe(kf).unwrap().refinement,
                RefinementOutcome::NotScheduled
            );
        }
    }

    #[test]
    fn test_unshared_keyframes_give_no_data() {
        let mut backend = Backend::new(map(), every_second(3), Some(Arc::new(FailingRefiner)));
        backend
            .process_new_keyframe(keyframe_with_points(0, SE3::identity(), &[Vector3::new(5.0, 5.0, 5.0)]))
            .unwrap();
        let report = backend
            .process_new_keyframe(keyframe_with_points(1, SE3::identity(), &[Vector3::new(-5.0, 5.0, 5.0)]))
            .unwrap();

        assert_eq!(report.refinement, RefinementOutcome::Failed(RefineError::NoData));
    }

    #[test]
    fn test_single_point_window_is_underdetermined() {
        let mut backend = Backend::new(map(), every_second(5), Some(Arc::new(LmRefiner::default())));
        for i in 0..2 {
            let report = backend
                .process_new_keyframe(keyframe_with_points(i, SE3::identity(), &[Vector3::new(1.0, 1.0, 1.0)]))
                .unwrap();
            if i == 1 {
                assert!(matches!(
                    report.refinement,
                    RefinementOutcome::Failed(RefineError::Underdetermined { .. })
                ));
            }
        }
        let surfel = backend.map().surfels()[0];
        assert_relative_eq!(surfel.position, Vector3::new(1.0, 1.0, 1.0), epsilon = 1e-9);
    }

    #[test]
    fn test_non_rigid_keyframe_is_rejected() {
        let mut backend = Backend::new(map(), BackendConfig::default(), None);
        let pose = SE3 {
            rotation: UnitQuaternion::new_unchecked(Quaternion::new(2.0, 0.0, 0.0, 0.0)),
            translation: Vector3::zeros(),
        };

        let err = backend
            .process_new_keyframe(keyframe_with_points(7, pose, &points()))
            .unwrap_err();

        assert_eq!(err, MapError::NonRigidPose { keyframe_id: 7 });
        assert_eq!(backend.keyframes_fused(), 0);
        assert!(backend.map().is_empty());
    }

    #[test]
    fn test_history_is_bounded_and_subsampled() {
        let config = BackendConfig {
            optimization_window_size: 2,
            optimization_interval: 100,
            max_observations_per_keyframe: 2,
        };
        let mut backend = Backend::new(map(), config, None);
        for i in 0..20 {
            backend
                .process_new_keyframe(keyframe_with_points(i, SE3::identity(), &points()))
                .unwrap();
        }

        assert_eq!(backend.history.len(), 2 * HISTORY_PER_WINDOW_SLOT);
        assert!(backend.history.iter().all(|r| r.observations.len() <= 2));
        assert_eq!(backend.history.back().unwrap().id, KeyframeId::new(19));
    }
}
