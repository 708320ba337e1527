//! Terrain detail density: capture, runtime edits, baked persistence.

pub mod bake;
pub mod density;
pub mod region;

pub use bake::{BAKED_DENSITY_SUFFIX, baked_file_name, baked_path, load_baked, save_baked};
pub use density::DetailDensityPipeline;
pub use region::RegionShape;
