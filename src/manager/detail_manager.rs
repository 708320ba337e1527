//! Detail manager: per-terrain density textures and the per-prototype
//! parameters the detail shaders read.

use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};

use super::{ManagerCore, ManagerFix, ManagerIssue, PrototypeData};
use crate::assets::AssetCatalog;
use crate::backend::{BufferId, BufferUsage, RenderBackend, TextureId};
use crate::config::InstancingConfig;
use crate::core::{Error, Result};
use crate::detail::{DetailDensityPipeline, RegionShape};
use crate::prototype::{InstanceProfile, PrototypeDescriptor};
use crate::terrain::{TerrainId, TerrainRegistry};

/// Shader parameters of one detail prototype.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct DetailParams {
    /// Multiplier on the painted density
    pub density_adjustment: f32,
    pub noise_seed: u32,
    pub min_width: f32,
    pub max_width: f32,
    pub min_height: f32,
    pub max_height: f32,
    pub _pad: [u32; 2],
}

impl Default for DetailParams {
    fn default() -> Self {
        Self {
            density_adjustment: 1.0,
            noise_seed: 0,
            min_width: 0.8,
            max_width: 1.2,
            min_height: 0.8,
            max_height: 1.2,
            _pad: [0; 2],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct DetailPrototypeData {
    pub params: DetailParams,
    buffer: Option<BufferId>,
}

impl DetailPrototypeData {
    pub fn new(params: DetailParams) -> Self {
        Self { params, buffer: None }
    }

    /// Parameter buffer, present while the prototype is bound.
    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    fn upload(&self, backend: &mut dyn RenderBackend) -> Result<()> {
        match self.buffer {
            Some(buffer) => backend.write_buffer(buffer, 0, bytemuck::bytes_of(&self.params)),
            None => Ok(()),
        }
    }
}

impl PrototypeData for DetailPrototypeData {
    fn prepare(&mut self, backend: &mut dyn RenderBackend) -> Result<()> {
        if self.buffer.is_none() {
            let size = std::mem::size_of::<DetailParams>() as u64;
            self.buffer = Some(backend.create_buffer("detail params", BufferUsage::Params, size));
        }
        self.upload(backend)
    }

    fn release(&mut self, backend: &mut dyn RenderBackend) {
        if let Some(buffer) = self.buffer.take() {
            backend.release_buffer(buffer);
        }
    }
}

/// A terrain, the mapping from its detail layers to manager prototypes and
/// this manager's density textures for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetailTerrain {
    pub terrain: TerrainId,
    pub layer_table: Vec<Option<usize>>,
    /// Indexed by detail layer
    textures: Vec<TextureId>,
    revision: Option<u64>,
}

impl DetailTerrain {
    /// Layers whose prototype passes `filter`; every layer when `filter` is None.
    fn layers(&self, filter: Option<&[usize]>) -> Vec<usize> {
        match filter {
            None => (0..self.layer_table.len()).collect(),
            Some(wanted) => self
                .layer_table
                .iter()
                .enumerate()
                .filter(|(_, p)| p.is_some_and(|p| wanted.contains(&p)))
                .map(|(layer, _)| layer)
                .collect(),
        }
    }
}

pub struct DetailManager {
    core: ManagerCore<DetailPrototypeData>,
    pipeline: DetailDensityPipeline,
    terrains: Vec<DetailTerrain>,
    dirty: bool,
    reload: bool,
}

impl DetailManager {
    pub fn new(config: &InstancingConfig) -> Self {
        Self {
            core: ManagerCore::new("detail", config, false),
            pipeline: DetailDensityPipeline::new(&config.detail),
            terrains: Vec::new(),
            dirty: false,
            reload: false,
        }
    }

    pub fn core(&self) -> &ManagerCore<DetailPrototypeData> {
        &self.core
    }

    pub fn pipeline(&self) -> &DetailDensityPipeline {
        &self.pipeline
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Bind prototypes and build density textures for every terrain.
    pub fn initialize(&mut self, backend: &mut dyn RenderBackend, terrains: &mut TerrainRegistry) -> Result<()> {
        self.core.initialize(backend)?;
        self.rebuild_layer_tables(terrains);
        self.dirty = true;
        self.sync(backend, terrains)?;
        Ok(())
    }

    pub fn dispose(&mut self, backend: &mut dyn RenderBackend) {
        for entry in &mut self.terrains {
            self.pipeline.release_textures(backend, &mut entry.textures);
            entry.revision = None;
        }
        self.core.dispose(backend);
        self.dirty = false;
        self.reload = false;
    }

    /// Returns false if the terrain was already added.
    pub fn add_terrain(&mut self, terrains: &TerrainRegistry, terrain: TerrainId) -> Result<bool> {
        if !terrains.contains(terrain) {
            return Err(Error::InvalidHandle { kind: "terrain" });
        }
        if self.terrains.iter().any(|t| t.terrain == terrain) {
            return Ok(false);
        }
        let layer_table = self.layer_table(terrains, terrain);
        self.terrains.push(DetailTerrain {
            terrain,
            layer_table,
            textures: Vec::new(),
            revision: None,
        });
        self.dirty = true;
        Ok(true)
    }

    /// Stop managing a terrain and release this manager's density textures for it.
    pub fn remove_terrain(&mut self, backend: &mut dyn RenderBackend, terrain: TerrainId) -> bool {
        let Some(pos) = self.terrains.iter().position(|t| t.terrain == terrain) else {
            return false;
        };
        let mut entry = self.terrains.remove(pos);
        self.pipeline.release_textures(backend, &mut entry.textures);
        true
    }

    pub fn terrains(&self) -> impl Iterator<Item = TerrainId> + '_ {
        self.terrains.iter().map(|t| t.terrain)
    }

    fn layer_table(&self, terrains: &TerrainRegistry, terrain: TerrainId) -> Vec<Option<usize>> {
        terrains.get(terrain).map_or_else(Vec::new, |t| {
            t.data()
                .detail_prototypes()
                .iter()
                .map(|name| self.core.index_of(name))
                .collect()
        })
    }

    fn rebuild_layer_tables(&mut self, terrains: &TerrainRegistry) {
        let tables: Vec<_> = self
            .terrains
            .iter()
            .map(|t| self.layer_table(terrains, t.terrain))
            .collect();
        for (entry, table) in self.terrains.iter_mut().zip(tables) {
            entry.layer_table = table;
        }
    }

    pub fn add_prototype(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrains: &TerrainRegistry,
        descriptor: PrototypeDescriptor,
        profile: InstanceProfile,
        params: DetailParams,
    ) -> Result<usize> {
        let index = self
            .core
            .add_prototype(backend, descriptor, profile, DetailPrototypeData::new(params))?;
        self.rebuild_layer_tables(terrains);
        Ok(index)
    }

    pub fn remove_prototype_at(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrains: &TerrainRegistry,
        index: usize,
    ) -> Result<()> {
        self.core.remove_prototype_at(backend, index)?;
        self.rebuild_layer_tables(terrains);
        Ok(())
    }

    pub fn check_prototype_changes(&mut self, backend: &mut dyn RenderBackend, terrains: &TerrainRegistry) -> Result<usize> {
        let pruned = self.core.check_prototype_changes(backend)?;
        if pruned > 0 {
            self.rebuild_layer_tables(terrains);
        }
        Ok(pruned)
    }

    pub fn set_prototype_enabled(&mut self, backend: &mut dyn RenderBackend, index: usize, enabled: bool) -> Result<()> {
        self.core.set_prototype_enabled(backend, index, enabled)
    }

    pub fn detail_params(&self, index: usize) -> Option<DetailParams> {
        self.core.data(index).map(|d| d.params)
    }

    /// Store new parameters and upload them when the prototype is bound.
    pub fn set_detail_params(&mut self, backend: &mut dyn RenderBackend, index: usize, params: DetailParams) -> Result<()> {
        let count = self.core.len();
        let data = self.core.data_mut(index).ok_or(Error::PrototypeIndex { index, count })?;
        data.params = params;
        data.upload(backend)
    }

    /// Import every detail prototype the managed terrains reference.
    pub fn add_prototypes_from_terrains(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrains: &TerrainRegistry,
        catalog: &AssetCatalog,
    ) -> Result<usize> {
        let names: Vec<String> = self
            .terrains
            .iter()
            .filter_map(|t| terrains.get(t.terrain))
            .flat_map(|t| t.data().detail_prototypes().to_vec())
            .collect();
        let added = self.core.import_prototypes(
            backend,
            names.iter().map(String::as_str),
            catalog,
            DetailPrototypeData::default,
        )?;
        if added > 0 {
            self.rebuild_layer_tables(terrains);
        }
        Ok(added)
    }

    /// Schedule a texture sync; `reload` rebuilds every texture from the
    /// terrain data.
    pub fn require_update(&mut self, reload: bool) {
        self.dirty = true;
        self.reload |= reload;
    }

    /// Per-frame tick. Drops terrains that left the registry and rebuilds
    /// textures of terrains whose data changed. Returns the synced terrain count.
    pub fn update(&mut self, backend: &mut dyn RenderBackend, terrains: &mut TerrainRegistry) -> Result<usize> {
        if !self.core.is_initialized() {
            return Ok(0);
        }
        self.core.poll_readbacks(backend);
        let (kept, gone): (Vec<_>, Vec<_>) = std::mem::take(&mut self.terrains)
            .into_iter()
            .partition(|t| terrains.contains(t.terrain));
        self.terrains = kept;
        if !gone.is_empty() {
            log::debug!("Detail manager dropped {} removed terrains", gone.len());
        }
        for mut entry in gone {
            self.pipeline.release_textures(backend, &mut entry.textures);
        }
        let changed = self
            .terrains
            .iter()
            .any(|t| terrains.get(t.terrain).is_some_and(|terrain| Some(terrain.revision()) != t.revision));
        if changed {
            self.rebuild_layer_tables(terrains);
            self.dirty = true;
        }
        self.sync(backend, terrains)
    }

    fn sync(&mut self, backend: &mut dyn RenderBackend, terrains: &mut TerrainRegistry) -> Result<usize> {
        if !self.dirty {
            return Ok(0);
        }
        let reload = std::mem::take(&mut self.reload);
        let mut synced = 0;
        for entry in &mut self.terrains {
            let Some(terrain) = terrains.get_mut(entry.terrain) else {
                continue;
            };
            let replaced = entry.revision.is_some_and(|r| r != terrain.revision());
            if reload || replaced {
                self.pipeline.reload_terrain(backend, terrain, &mut entry.textures)?;
            } else {
                self.pipeline.sync_terrain(backend, terrain, &mut entry.textures)?;
            }
            entry.revision = Some(terrain.revision());
            synced += 1;
        }
        self.dirty = false;
        Ok(synced)
    }

    /// Density textures built for a prototype: one per terrain layer mapped to it.
    pub fn registered_instance_count(&self, index: usize) -> u32 {
        if self.core.render_key(index).is_none() {
            return 0;
        }
        self.terrains
            .iter()
            .map(|t| {
                t.layers(Some(std::slice::from_ref(&index)))
                    .into_iter()
                    .filter(|&layer| layer < t.textures.len())
                    .count() as u32
            })
            .sum()
    }

    /// Overwrite density inside `shape` on every managed terrain. `filter`
    /// names manager prototype indices; None paints every layer. Returns the
    /// dispatch count.
    pub fn set_detail_density_inside_shape(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrains: &mut TerrainRegistry,
        shape: &RegionShape,
        value: u32,
        offset: f32,
        filter: Option<&[usize]>,
    ) -> Result<usize> {
        if !self.core.is_initialized() {
            return Ok(0);
        }
        let mut dispatches = 0;
        for entry in &self.terrains {
            let Some(terrain) = terrains.get_mut(entry.terrain) else {
                continue;
            };
            if !terrain.enabled {
                continue;
            }
            let layers = entry.layers(filter);
            dispatches += self.pipeline.set_detail_density_in_region(
                backend,
                terrain,
                &entry.textures,
                shape,
                value,
                offset,
                &layers,
            )?;
        }
        Ok(dispatches)
    }

    /// Write every density texture of every managed terrain to `dir`.
    pub fn save_baked_textures(
        &self,
        backend: &mut dyn RenderBackend,
        terrains: &TerrainRegistry,
        dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        for entry in &self.terrains {
            if let Some(terrain) = terrains.get(entry.terrain) {
                written.extend(self.pipeline.save_baked_terrain(backend, terrain, &entry.textures, dir)?);
            }
        }
        log::info!("Saved {} baked density textures to {}", written.len(), dir.display());
        Ok(written)
    }

    fn entry(&self, terrain: TerrainId) -> Option<&DetailTerrain> {
        self.terrains.iter().find(|t| t.terrain == terrain)
    }

    pub fn density_texture(&self, terrain: TerrainId, layer: usize) -> Option<TextureId> {
        self.entry(terrain).and_then(|t| t.textures.get(layer).copied())
    }

    /// Blocking read of one density layer.
    pub fn read_density(&self, backend: &mut dyn RenderBackend, terrain: TerrainId, layer: usize) -> Result<Option<Vec<u8>>> {
        match self.entry(terrain) {
            Some(t) => self.pipeline.read_density(backend, &t.textures, layer),
            None => Ok(None),
        }
    }

    pub fn manager_issue(&self, terrains: &TerrainRegistry) -> Option<ManagerIssue> {
        let referenced = self
            .terrains
            .iter()
            .filter_map(|t| terrains.get(t.terrain))
            .any(|t| !t.data().detail_prototypes().is_empty());
        self.core.issue(self.terrains.len(), referenced)
    }

    pub fn apply_fix(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrains: &TerrainRegistry,
        catalog: &AssetCatalog,
        fix: ManagerFix,
    ) -> Result<usize> {
        match fix {
            ManagerFix::ImportTerrainPrototypes => self.add_prototypes_from_terrains(backend, terrains, catalog),
        }
    }
}
