//! Terrain data provider interface.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::TreeInstanceRecord;

/// Square grid of normalized heights, row-major with rows along Z.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heightmap {
    pub resolution: u32,
    /// `resolution * resolution` values in [0,1], scaled by terrain height
    pub heights: Vec<f32>,
}

impl Heightmap {
    pub fn new(resolution: u32, heights: Vec<f32>) -> Self {
        Self { resolution, heights }
    }

    pub fn flat(resolution: u32, height: f32) -> Self {
        Self::new(resolution, vec![height; (resolution * resolution) as usize])
    }

    pub fn is_valid(&self) -> bool {
        self.resolution > 0 && self.heights.len() == (self.resolution * self.resolution) as usize
    }

    /// Little-endian f32 texels for upload
    pub fn to_texels(&self) -> Vec<u8> {
        self.heights.iter().flat_map(|h| h.to_le_bytes()).collect()
    }
}

/// Square solid/hole mask, same layout as `Heightmap`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HolesMask {
    pub resolution: u32,
    /// true where the surface exists
    pub solid: Vec<bool>,
}

impl HolesMask {
    pub fn new(resolution: u32, solid: Vec<bool>) -> Self {
        Self { resolution, solid }
    }

    pub fn solid(resolution: u32) -> Self {
        Self::new(resolution, vec![true; (resolution * resolution) as usize])
    }

    pub fn set_hole(&mut self, x: u32, z: u32) {
        if let Some(cell) = self.solid.get_mut((z * self.resolution + x) as usize) {
            *cell = false;
        }
    }

    pub fn is_valid(&self) -> bool {
        self.resolution > 0 && self.solid.len() == (self.resolution * self.resolution) as usize
    }

    /// 1.0 for solid, 0.0 for hole, little-endian f32
    pub fn to_texels(&self) -> Vec<u8> {
        self.solid
            .iter()
            .flat_map(|&s| if s { 1.0f32 } else { 0.0f32 }.to_le_bytes())
            .collect()
    }
}

/// Authoring data behind a terrain.
///
/// The pipeline only reads through this trait; where the data comes from
/// (a JSON file, an engine asset, a procedural source) is up to the
/// implementor.
pub trait TerrainData: Send + Sync {
    fn name(&self) -> &str;

    /// World-space extent (x, max height, z)
    fn size(&self) -> Vec3;

    fn heightmap(&self) -> Option<&Heightmap>;

    fn holes(&self) -> Option<&HolesMask>;

    /// Prototype names referenced by `TreeInstanceRecord::prototype_index`
    fn tree_prototypes(&self) -> &[String];

    /// Tree placements. `reload` asks the provider to bypass any cache of its own.
    fn tree_instances(&self, reload: bool) -> Vec<TreeInstanceRecord>;

    /// Prototype names, one per detail layer
    fn detail_prototypes(&self) -> &[String];

    /// Cells per side of every detail layer
    fn detail_resolution(&self) -> u32;

    /// Raw per-cell density of one layer, row-major, `resolution^2` cells
    fn detail_layer(&self, layer: usize) -> Option<&[u32]>;

    fn detail_layer_count(&self) -> usize {
        self.detail_prototypes().len()
    }
}
