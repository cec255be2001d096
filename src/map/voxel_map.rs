//! Sparse voxel hash of surfels.
//!
//! The map is written by the backend only and read concurrently by the
//! presentation layer. A single coarse `RwLock` guards the whole grid and
//! `fuse` holds the write side for one keyframe at a time, so readers see
//! either all of a keyframe's updates or none of them.

use std::collections::HashMap;

use nalgebra::Vector3;
use parking_lot::RwLock;
use tracing::debug;

use super::keyframe::Keyframe;
use super::surfel::{Surfel, SurfelParams, SurfelSample};
use crate::error::MapError;
use crate::frame::NEUTRAL_GRAY;

/// Tolerance on the pose quaternion norm accepted by `fuse`.
const POSE_RIGIDITY_TOLERANCE: f64 = 1e-6;

/// Integer grid coordinate of a voxel cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct VoxelIndex {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl VoxelIndex {
    pub(crate) fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }

    /// floor(p / voxel_size), component-wise.
    pub(crate) fn from_point(p: &Vector3<f64>, voxel_size: f64) -> Self {
        Self {
            x: (p.x / voxel_size).floor() as i64,
            y: (p.y / voxel_size).floor() as i64,
            z: (p.z / voxel_size).floor() as i64,
        }
    }
}

/// Counters describing one `fuse` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionStats {
    /// Points that landed in a new cell.
    pub created: usize,
    /// Points averaged into an existing surfel.
    pub updated: usize,
    /// Non-finite points that were ignored.
    pub skipped: usize,
    /// Points whose color fell back to neutral gray.
    pub uncolored: usize,
}

impl FusionStats {
    pub fn fused(&self) -> usize {
        self.created + self.updated
    }
}

/// Thread-safe sparse map from voxel cell to fused surfel.
#[derive(Debug)]
pub struct VoxelMap {
    voxel_size: f64,
    params: SurfelParams,
    cells: RwLock<HashMap<VoxelIndex, Surfel>>,
}

impl VoxelMap {
    /// Create an empty map with default surfel parameters.
    pub fn new(voxel_size: f64) -> Result<Self, MapError> {
        Self::with_params(voxel_size, SurfelParams::default())
    }

    pub fn with_params(voxel_size: f64, params: SurfelParams) -> Result<Self, MapError> {
        if !voxel_size.is_finite() || voxel_size <= 0.0 {
            return Err(MapError::InvalidVoxelSize(voxel_size));
        }
        Ok(Self {
            voxel_size,
            params,
            cells: RwLock::new(HashMap::new()),
        })
    }

    pub fn voxel_size(&self) -> f64 {
        self.voxel_size
    }

    pub fn params(&self) -> &SurfelParams {
        &self.params
    }

    /// Number of occupied cells.
    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }

    pub(crate) fn index_of(&self, p: &Vector3<f64>) -> VoxelIndex {
        VoxelIndex::from_point(p, self.voxel_size)
    }

    /// Fuse every point of `keyframe` into the map.
    ///
    /// Fails with [`MapError::NonRigidPose`] before touching the map if the
    /// keyframe pose is not a rigid transform. An empty cloud is a no-op.
    pub fn fuse(&self, keyframe: &Keyframe) -> Result<FusionStats, MapError> {
        let mut stats = FusionStats::default();
        if keyframe.points.is_empty() {
            return Ok(stats);
        }

        if !keyframe.pose.is_rigid(POSE_RIGIDITY_TOLERANCE) {
            return Err(MapError::NonRigidPose {
                keyframe_id: keyframe.id.0,
            });
        }

        // Everything that does not need the map is computed before locking.
        let samples = self.prepare_samples(keyframe, &mut stats);

        let min_radius = self.voxel_size * 0.5;
        let radius_bounds = (min_radius, self.voxel_size * 3f64.sqrt());

        let mut cells = self.cells.write();
        for (index, sample) in &samples {
            match cells.get_mut(index) {
                Some(surfel) => {
                    surfel.integrate(sample, &self.params, radius_bounds);
                    stats.updated += 1;
                }
                None => {
                    cells.insert(*index, Surfel::from_sample(sample, min_radius, &self.params));
                    stats.created += 1;
                }
            }
        }
        let total = cells.len();
        drop(cells);

        debug!(
            "[Fusion] {} points={} created={} updated={} skipped={} gray={} surfels={}",
            keyframe.id,
            keyframe.points.len(),
            stats.created,
            stats.updated,
            stats.skipped,
            stats.uncolored,
            total
        );

        Ok(stats)
    }

    fn prepare_samples(
        &self,
        keyframe: &Keyframe,
        stats: &mut FusionStats,
    ) -> Vec<(VoxelIndex, SurfelSample)> {
        let pose = &keyframe.pose;
        let center = keyframe.camera_center();
        let forward = pose.forward();
        let gray = Vector3::repeat(NEUTRAL_GRAY);

        let mut samples = Vec::with_capacity(keyframe.points.len());
        for (i, p_local) in keyframe.points.iter().enumerate() {
            let p_local = p_local.cast::<f64>();
            if !p_local.iter().all(|v| v.is_finite()) {
                stats.skipped += 1;
                continue;
            }

            let position = pose.transform_point(&p_local);
            let normal = (position - center).try_normalize(1e-12).unwrap_or(forward);

            let color = match keyframe
                .tex_coords
                .get(i)
                .and_then(|uv| keyframe.image.sample(uv))
            {
                Some(c) => c,
                None => {
                    stats.uncolored += 1;
                    gray
                }
            };

            samples.push((
                self.index_of(&position),
                SurfelSample {
                    position,
                    normal,
                    color,
                    timestamp: keyframe.timestamp,
                },
            ));
        }
        samples
    }

    /// Snapshot copy of all surfels. No ordering is guaranteed.
    pub fn surfels(&self) -> Vec<Surfel> {
        self.cells.read().values().copied().collect()
    }

    /// Surfel of the cell containing `point`, if any.
    pub fn surfel_at(&self, point: &Vector3<f64>) -> Option<Surfel> {
        let index = self.index_of(point);
        self.cells.read().get(&index).copied()
    }

    pub(crate) fn surfel_at_index(&self, index: &VoxelIndex) -> Option<Surfel> {
        self.cells.read().get(index).copied()
    }

    /// Positions of the given cells, read under one lock acquisition.
    pub(crate) fn positions_of(&self, indices: &[VoxelIndex]) -> Vec<Option<Vector3<f64>>> {
        let cells = self.cells.read();
        indices
            .iter()
            .map(|index| cells.get(index).map(|s| s.position))
            .collect()
    }

    /// Overwrite surfel positions with refined values.
    ///
    /// Cells keep their key even if the corrected position drifts across a
    /// cell border. Missing cells and non-finite positions are skipped.
    /// Returns the number of surfels updated.
    pub(crate) fn apply_corrections(&self, corrections: &[(VoxelIndex, Vector3<f64>)]) -> usize {
        let mut cells = self.cells.write();
        let mut updated = 0;
        for (index, position) in corrections {
            if !position.iter().all(|v| v.is_finite()) {
                continue;
            }
            if let Some(surfel) = cells.get_mut(index) {
                surfel.position = *position;
                updated += 1;
            }
        }
        updated
    }

    /// Remove every surfel.
    pub fn clear(&self) {
        self.cells.write().clear();
    }
}
