//! Geometry utilities: SE3 transforms, rigid 3D-3D alignment.

pub mod alignment;
pub mod se3;

pub use alignment::{RigidAlignment, RigidRansacConfig, align_rigid_horn, align_rigid_ransac};
pub use se3::SE3;
