//! Pipeline configuration.
//!
//! Every field has a default, so a TOML file only needs to list the values
//! it overrides:
//!
//! ```toml
//! voxel_size = 0.02
//! keyframe_translation_threshold = 0.05
//!
//! [tracking]
//! min_confidence = 0.4
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mapping::BackendConfig;
use crate::map::SurfelParams;
use crate::optimizer::LocalBAConfigLM;
use crate::tracking::{KeyframeGate, TrackingConfig};

/// Top-level configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Edge length of a voxel cell in meters.
    pub voxel_size: f64,
    /// Camera translation (m) since the last keyframe that triggers a new one.
    pub keyframe_translation_threshold: f64,
    /// Camera rotation (rad) since the last keyframe that triggers a new one.
    pub keyframe_rotation_threshold_radians: f64,
    /// Keyframes per local refinement window. 0 or 1 disables refinement.
    pub optimization_window_size: usize,
    /// Run local refinement every this many fused keyframes.
    pub optimization_interval: usize,
    pub max_observations_per_keyframe: usize,
    pub surfel: SurfelParams,
    pub tracking: TrackingConfig,
    pub refiner: LocalBAConfigLM,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.05,
            keyframe_translation_threshold: 0.1,
            keyframe_rotation_threshold_radians: 10f64.to_radians(),
            optimization_window_size: 5,
            optimization_interval: 5,
            max_observations_per_keyframe: 64,
            surfel: SurfelParams::default(),
            tracking: TrackingConfig::default(),
            refiner: LocalBAConfigLM::default(),
        }
    }
}

impl PipelineConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.voxel_size.is_finite() || self.voxel_size <= 0.0 {
            return Err(ConfigError::invalid(
                "voxel_size",
                format!("must be finite and > 0, got {}", self.voxel_size),
            ));
        }
        non_negative(
            "keyframe_translation_threshold",
            self.keyframe_translation_threshold,
        )?;
        non_negative(
            "keyframe_rotation_threshold_radians",
            self.keyframe_rotation_threshold_radians,
        )?;
        if self.optimization_interval == 0 {
            return Err(ConfigError::invalid("optimization_interval", "must be >= 1"));
        }
        if self.max_observations_per_keyframe == 0 {
            return Err(ConfigError::invalid(
                "max_observations_per_keyframe",
                "must be >= 1",
            ));
        }

        unit_interval("surfel.initial_confidence", self.surfel.initial_confidence)?;
        non_negative("surfel.confidence_step", self.surfel.confidence_step)?;

        unit_interval("tracking.min_confidence", self.tracking.min_confidence)?;
        let odometry = &self.tracking.odometry;
        if !odometry.verification_radius.is_finite() || odometry.verification_radius <= 0.0 {
            return Err(ConfigError::invalid(
                "tracking.odometry.verification_radius",
                "must be finite and > 0",
            ));
        }
        if odometry.max_verification_points == 0 {
            return Err(ConfigError::invalid(
                "tracking.odometry.max_verification_points",
                "must be >= 1",
            ));
        }
        if odometry.min_matches < 3 {
            return Err(ConfigError::invalid(
                "tracking.odometry.min_matches",
                "rigid alignment needs at least 3 matches",
            ));
        }

        Ok(())
    }

    pub fn keyframe_gate(&self) -> KeyframeGate {
        KeyframeGate::new(
            self.keyframe_translation_threshold,
            self.keyframe_rotation_threshold_radians,
        )
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            optimization_window_size: self.optimization_window_size,
            optimization_interval: self.optimization_interval,
            max_observations_per_keyframe: self.max_observations_per_keyframe,
        }
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::invalid(
            field,
            format!("must be finite and >= 0, got {}", value),
        ));
    }
    Ok(())
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(
            field,
            format!("must be within [0, 1], got {}", value),
        ));
    }
    Ok(())
}
