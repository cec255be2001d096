//! Error types for the dense-mapping pipeline.
//!
//! Only fatal conditions are represented here. Per-point and per-frame
//! problems (bad texture coordinates, tracking loss) are absorbed by the
//! stage that hits them and never surface as errors.

use thiserror::Error;

/// Errors raised by [`crate::map::VoxelMap`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MapError {
    #[error("voxel size must be a finite value > 0, got {0}")]
    InvalidVoxelSize(f64),

    #[error("keyframe {keyframe_id} pose is not a rigid transform")]
    NonRigidPose { keyframe_id: u64 },
}

/// Configuration validation / loading errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read config: {0}")]
    Io(String),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Failure of the local refinement capability.
///
/// Always recoverable: the backend logs it and skips the cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefineError {
    #[error("refinement problem has no free parameters or observations")]
    NoData,

    #[error("refinement problem is underdetermined ({residuals} residuals < {parameters} parameters)")]
    Underdetermined { residuals: usize, parameters: usize },

    #[error("solver did not converge: {0}")]
    Solver(String),

    #[error("solver returned non-finite values")]
    NonFinite,
}

/// Pipeline lifecycle errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("pipeline is not running")]
    NotRunning,

    #[error("failed to spawn {stage} thread: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
