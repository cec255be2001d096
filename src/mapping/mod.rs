//! Mapping stage: keyframe fusion and local refinement.

pub mod backend;

pub use backend::{Backend, BackendConfig, BackendReport, RefinementOutcome};
