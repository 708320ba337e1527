//! Terrains as seen by the instancing pipeline.
//!
//! A `Terrain` pairs a world transform with a `TerrainData` provider and
//! caches the heightmap and holes textures built from it. Managers refer to
//! terrains by `TerrainId` and never own them; density textures live in the
//! detail managers.

pub mod asset;
pub mod data;
pub mod record;

pub use asset::TerrainAsset;
pub use data::{Heightmap, HolesMask, TerrainData};
pub use record::TreeInstanceRecord;

use glam::{Mat4, Quat, Vec3};

use crate::backend::{Handle, HandleTable, RenderBackend, TextureFormat, TextureId};
use crate::core::Result;
use crate::math::Aabb;

/// A placed terrain.
pub struct Terrain {
    pub position: Vec3,
    pub rotation: Quat,
    /// Render-enabled; disabled terrains contribute no instances
    pub enabled: bool,
    /// Density textures come from baked files rather than capture
    pub detail_baked: bool,
    data: Box<dyn TerrainData>,
    heightmap_texture: Option<TextureId>,
    holes_texture: Option<TextureId>,
    revision: u64,
}

impl Terrain {
    pub fn new(data: impl TerrainData + 'static) -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            enabled: true,
            detail_baked: false,
            data: Box::new(data),
            heightmap_texture: None,
            holes_texture: None,
            revision: 0,
        }
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn name(&self) -> &str {
        self.data.name()
    }

    pub fn size(&self) -> Vec3 {
        self.data.size()
    }

    pub fn data(&self) -> &dyn TerrainData {
        self.data.as_ref()
    }

    /// Bumped whenever the data provider is replaced
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn has_rotation(&self) -> bool {
        !self.rotation.abs_diff_eq(Quat::IDENTITY, 1e-6)
    }

    pub fn transform(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }

    /// World-space bounds of the full terrain volume
    pub fn world_bounds(&self) -> Aabb {
        Aabb::new(Vec3::ZERO, self.size()).transformed(&self.transform())
    }

    /// Swap the data provider. GPU textures built from the old data are released.
    pub fn replace_data(&mut self, backend: &mut dyn RenderBackend, data: impl TerrainData + 'static) {
        self.release_gpu(backend);
        self.data = Box::new(data);
        self.revision += 1;
    }

    /// Heightmap texture, uploaded on first use. None when the terrain has no heightmap.
    pub fn heightmap_texture(&mut self, backend: &mut dyn RenderBackend) -> Result<Option<TextureId>> {
        if let Some(id) = self.heightmap_texture {
            return Ok(Some(id));
        }
        let Some(heightmap) = self.data.heightmap().filter(|h| h.is_valid()) else {
            return Ok(None);
        };
        let label = format!("{} heightmap", self.data.name());
        let id = backend.create_texture(&label, TextureFormat::Height32F, heightmap.resolution, heightmap.resolution);
        if let Err(e) = backend.write_texture(id, &heightmap.to_texels()) {
            backend.release_texture(id);
            return Err(e);
        }
        self.heightmap_texture = Some(id);
        Ok(Some(id))
    }

    pub fn heightmap_resolution(&self) -> u32 {
        self.data.heightmap().map_or(0, |h| h.resolution)
    }

    /// Holes texture, uploaded on first use. None when the terrain has no holes.
    pub fn holes_texture(&mut self, backend: &mut dyn RenderBackend) -> Result<Option<TextureId>> {
        if let Some(id) = self.holes_texture {
            return Ok(Some(id));
        }
        let Some(holes) = self.data.holes().filter(|h| h.is_valid()) else {
            return Ok(None);
        };
        let label = format!("{} holes", self.data.name());
        let id = backend.create_texture(&label, TextureFormat::Height32F, holes.resolution, holes.resolution);
        if let Err(e) = backend.write_texture(id, &holes.to_texels()) {
            backend.release_texture(id);
            return Err(e);
        }
        self.holes_texture = Some(id);
        Ok(Some(id))
    }

    pub fn holes_resolution(&self) -> u32 {
        self.data.holes().map_or(0, |h| h.resolution)
    }

    /// Release every texture built from this terrain.
    pub fn release_gpu(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(id) = self.heightmap_texture.take() {
            backend.release_texture(id);
        }
        if let Some(id) = self.holes_texture.take() {
            backend.release_texture(id);
        }
    }
}

/// Handle to a terrain in a `TerrainRegistry`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TerrainId(Handle);

impl std::fmt::Display for TerrainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "terrain#{}", self.0.index())
    }
}

/// All loaded terrains.
#[derive(Default)]
pub struct TerrainRegistry {
    terrains: HandleTable<Terrain>,
}

impl TerrainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, terrain: Terrain) -> TerrainId {
        TerrainId(self.terrains.insert(terrain))
    }

    /// Remove a terrain and release its textures.
    pub fn remove(&mut self, backend: &mut dyn RenderBackend, id: TerrainId) -> Option<Terrain> {
        let mut terrain = self.terrains.remove(id.0)?;
        terrain.release_gpu(backend);
        Some(terrain)
    }

    pub fn get(&self, id: TerrainId) -> Option<&Terrain> {
        self.terrains.get(id.0)
    }

    pub fn get_mut(&mut self, id: TerrainId) -> Option<&mut Terrain> {
        self.terrains.get_mut(id.0)
    }

    pub fn contains(&self, id: TerrainId) -> bool {
        self.terrains.contains(id.0)
    }

    pub fn ids(&self) -> Vec<TerrainId> {
        self.terrains.handles().into_iter().map(TerrainId).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TerrainId, &Terrain)> + '_ {
        self.terrains.iter().map(|(h, t)| (TerrainId(h), t))
    }

    pub fn len(&self) -> usize {
        self.terrains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terrains.is_empty()
    }
}
