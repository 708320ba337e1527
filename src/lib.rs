//! Thicket - GPU-driven instancing of terrain trees and detail meshes

pub mod core;
pub mod math;
pub mod config;
pub mod backend;
pub mod assets;
pub mod prototype;
pub mod terrain;
pub mod instancing;
pub mod detail;
pub mod manager;

pub use backend::{HostBackend, RenderBackend, WgpuBackend};
pub use config::InstancingConfig;
pub use core::{Error, Result};
pub use manager::{DetailManager, TreeManager};
