//! Frame sources.

pub mod synthetic;

pub use synthetic::{CameraIntrinsics, SyntheticSensor, SyntheticSensorConfig};
