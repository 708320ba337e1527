//! In-memory terrain data, loadable from JSON.

use std::path::Path;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::data::{Heightmap, HolesMask, TerrainData};
use super::TreeInstanceRecord;
use crate::core::{Error, Result};

/// Current version of the terrain file format
pub const TERRAIN_ASSET_VERSION: u32 = 1;

/// Terrain authoring data held in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerrainAsset {
    /// Format version for compatibility
    #[serde(default = "default_version")]
    pub version: u32,
    pub name: String,
    pub size: [f32; 3],
    #[serde(default)]
    pub heightmap: Option<Heightmap>,
    #[serde(default)]
    pub holes: Option<HolesMask>,
    #[serde(default)]
    pub tree_prototypes: Vec<String>,
    #[serde(default)]
    pub trees: Vec<TreeInstanceRecord>,
    #[serde(default)]
    pub detail_prototypes: Vec<String>,
    #[serde(default)]
    pub detail_resolution: u32,
    /// One grid per detail prototype
    #[serde(default)]
    pub detail_layers: Vec<Vec<u32>>,
}

fn default_version() -> u32 {
    TERRAIN_ASSET_VERSION
}

impl TerrainAsset {
    /// Empty flat terrain of the given size
    pub fn new(name: impl Into<String>, size: Vec3) -> Self {
        Self {
            version: TERRAIN_ASSET_VERSION,
            name: name.into(),
            size: size.to_array(),
            heightmap: None,
            holes: None,
            tree_prototypes: Vec::new(),
            trees: Vec::new(),
            detail_prototypes: Vec::new(),
            detail_resolution: 0,
            detail_layers: Vec::new(),
        }
    }

    pub fn with_heightmap(mut self, heightmap: Heightmap) -> Self {
        self.heightmap = Some(heightmap);
        self
    }

    pub fn with_holes(mut self, holes: HolesMask) -> Self {
        self.holes = Some(holes);
        self
    }

    /// Add a tree prototype name, returning its terrain-local index.
    pub fn add_tree_prototype(&mut self, name: impl Into<String>) -> u32 {
        self.tree_prototypes.push(name.into());
        (self.tree_prototypes.len() - 1) as u32
    }

    /// Add a detail layer. Every layer shares `detail_resolution`.
    pub fn add_detail_layer(&mut self, name: impl Into<String>, cells: Vec<u32>) -> Result<usize> {
        let res = self.detail_resolution as usize;
        if cells.len() != res * res {
            return Err(Error::Terrain(format!(
                "detail layer has {} cells, terrain '{}' expects {}",
                cells.len(),
                self.name,
                res * res
            )));
        }
        self.detail_prototypes.push(name.into());
        self.detail_layers.push(cells);
        Ok(self.detail_layers.len() - 1)
    }

    /// Check grid sizes against the declared resolutions.
    pub fn validate(&self) -> Result<()> {
        if let Some(h) = &self.heightmap {
            if !h.is_valid() {
                return Err(Error::Terrain(format!("terrain '{}': malformed heightmap", self.name)));
            }
        }
        if let Some(h) = &self.holes {
            if !h.is_valid() {
                return Err(Error::Terrain(format!("terrain '{}': malformed holes mask", self.name)));
            }
        }
        if self.detail_layers.len() != self.detail_prototypes.len() {
            return Err(Error::Terrain(format!(
                "terrain '{}': {} detail layers for {} detail prototypes",
                self.name,
                self.detail_layers.len(),
                self.detail_prototypes.len()
            )));
        }
        let cells = (self.detail_resolution * self.detail_resolution) as usize;
        if let Some(i) = self.detail_layers.iter().position(|l| l.len() != cells) {
            return Err(Error::Terrain(format!(
                "terrain '{}': detail layer {i} does not match resolution {}",
                self.name, self.detail_resolution
            )));
        }
        Ok(())
    }

    /// Save to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file and validate
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let asset: TerrainAsset = serde_json::from_str(&json)?;
        if asset.version > TERRAIN_ASSET_VERSION {
            log::warn!(
                "Terrain file {} has version {}, newer than supported {}",
                path.display(),
                asset.version,
                TERRAIN_ASSET_VERSION
            );
        }
        asset.validate()?;
        Ok(asset)
    }
}

impl TerrainData for TerrainAsset {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> Vec3 {
        Vec3::from_array(self.size)
    }

    fn heightmap(&self) -> Option<&Heightmap> {
        self.heightmap.as_ref()
    }

    fn holes(&self) -> Option<&HolesMask> {
        self.holes.as_ref()
    }

    fn tree_prototypes(&self) -> &[String] {
        &self.tree_prototypes
    }

    fn tree_instances(&self, _reload: bool) -> Vec<TreeInstanceRecord> {
        self.trees.clone()
    }

    fn detail_prototypes(&self) -> &[String] {
        &self.detail_prototypes
    }

    fn detail_resolution(&self) -> u32 {
        self.detail_resolution
    }

    fn detail_layer(&self, layer: usize) -> Option<&[u32]> {
        self.detail_layers.get(layer).map(|l| l.as_slice())
    }
}
