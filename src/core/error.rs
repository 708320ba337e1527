//! Error types for the thicket instancing pipeline

use thiserror::Error;

use crate::prototype::ValidationError;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("GPU error: {0}")]
    Gpu(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Invalid {kind} handle")]
    InvalidHandle { kind: &'static str },

    #[error("Prototype rejected: {0}")]
    Prototype(ValidationError),

    #[error("Duplicate prototype: {0}")]
    DuplicatePrototype(String),

    #[error("Prototype index {index} out of range (count {count})")]
    PrototypeIndex { index: usize, count: usize },

    #[error("Terrain error: {0}")]
    Terrain(String),

    #[error("Readback error: {0}")]
    Readback(String),

    #[error("{required} instances exceed buffer capacity {capacity}")]
    Capacity { required: u32, capacity: u32 },

    #[error("Texture size mismatch: expected {expected} bytes, got {actual}")]
    TextureSize { expected: usize, actual: usize },
}
