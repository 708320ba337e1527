//! Shared aliases

pub use glam::{Mat4, Quat, Vec3};

/// Result type used across the pipeline
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;
