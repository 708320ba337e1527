//! Tree manager: terrain tree placements to per-prototype transform buffers.

use glam::Mat4;

use super::{ManagerCore, ManagerFix, ManagerIssue, PrototypeData};
use crate::assets::AssetCatalog;
use crate::backend::RenderBackend;
use crate::config::{InstancingConfig, TreeConfig};
use crate::core::{Error, Result};
use crate::instancing::{
    GeneratorState, PassStats, TreeInstanceGenerator, TreePrototypeInfo, TreeSettings, TreeTerrainBinding,
};
use crate::prototype::{InstanceProfile, PrototypeDescriptor};
use crate::terrain::{TerrainId, TerrainRegistry};

/// Per-prototype placement switches
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TreePrototypeData {
    pub settings: TreeSettings,
}

impl PrototypeData for TreePrototypeData {}

pub struct TreeManager {
    core: ManagerCore<TreePrototypeData>,
    config: TreeConfig,
    terrains: Vec<TreeTerrainBinding>,
    generator: TreeInstanceGenerator,
}

impl TreeManager {
    pub fn new(config: &InstancingConfig) -> Self {
        Self {
            core: ManagerCore::new("tree", config, true),
            config: config.tree.clone(),
            terrains: Vec::new(),
            generator: TreeInstanceGenerator::new(&config.tree),
        }
    }

    pub fn core(&self) -> &ManagerCore<TreePrototypeData> {
        &self.core
    }

    pub fn generator_state(&self) -> GeneratorState {
        self.generator.state()
    }

    pub fn initialize(&mut self, backend: &mut dyn RenderBackend, terrains: &TerrainRegistry) -> Result<()> {
        self.core.initialize(backend)?;
        self.rebuild_index_tables(terrains);
        self.generator.require_update(true);
        Ok(())
    }

    pub fn dispose(&mut self, backend: &mut dyn RenderBackend) {
        self.generator.release(backend);
        self.core.dispose(backend);
    }

    /// Start generating trees for a terrain. Returns false if already added.
    pub fn add_terrain(&mut self, terrains: &TerrainRegistry, terrain: TerrainId) -> Result<bool> {
        if !terrains.contains(terrain) {
            return Err(Error::InvalidHandle { kind: "terrain" });
        }
        if self.terrains.iter().any(|b| b.terrain == terrain) {
            return Ok(false);
        }
        let index_table = self.index_table(terrains, terrain);
        self.terrains.push(TreeTerrainBinding { terrain, index_table });
        self.generator.require_update(false);
        Ok(true)
    }

    pub fn remove_terrain(&mut self, terrain: TerrainId) -> bool {
        let before = self.terrains.len();
        self.terrains.retain(|b| b.terrain != terrain);
        let removed = self.terrains.len() != before;
        if removed {
            self.generator.forget(terrain);
            self.generator.require_update(false);
        }
        removed
    }

    pub fn terrains(&self) -> impl Iterator<Item = TerrainId> + '_ {
        self.terrains.iter().map(|b| b.terrain)
    }

    fn index_table(&self, terrains: &TerrainRegistry, terrain: TerrainId) -> Vec<Option<usize>> {
        terrains.get(terrain).map_or_else(Vec::new, |t| {
            t.data()
                .tree_prototypes()
                .iter()
                .map(|name| self.core.index_of(name))
                .collect()
        })
    }

    fn rebuild_index_tables(&mut self, terrains: &TerrainRegistry) {
        let tables: Vec<_> = self
            .terrains
            .iter()
            .map(|b| self.index_table(terrains, b.terrain))
            .collect();
        for (binding, table) in self.terrains.iter_mut().zip(tables) {
            binding.index_table = table;
        }
    }

    pub fn add_prototype(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrains: &TerrainRegistry,
        descriptor: PrototypeDescriptor,
        profile: InstanceProfile,
    ) -> Result<usize> {
        let settings = TreeSettings::from(&self.config);
        self.add_prototype_with_settings(backend, terrains, descriptor, profile, settings)
    }

    pub fn add_prototype_with_settings(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrains: &TerrainRegistry,
        descriptor: PrototypeDescriptor,
        profile: InstanceProfile,
        settings: TreeSettings,
    ) -> Result<usize> {
        let index = self
            .core
            .add_prototype(backend, descriptor, profile, TreePrototypeData { settings })?;
        self.rebuild_index_tables(terrains);
        self.generator.require_update(false);
        Ok(index)
    }

    pub fn remove_prototype_at(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrains: &TerrainRegistry,
        index: usize,
    ) -> Result<()> {
        self.core.remove_prototype_at(backend, index)?;
        self.rebuild_index_tables(terrains);
        self.generator.require_update(false);
        Ok(())
    }

    /// Re-validate prototypes and prune those whose asset is gone.
    pub fn check_prototype_changes(&mut self, backend: &mut dyn RenderBackend, terrains: &TerrainRegistry) -> Result<usize> {
        let pruned = self.core.check_prototype_changes(backend)?;
        if pruned > 0 {
            self.rebuild_index_tables(terrains);
            self.generator.require_update(false);
        }
        Ok(pruned)
    }

    pub fn set_prototype_enabled(&mut self, backend: &mut dyn RenderBackend, index: usize, enabled: bool) -> Result<()> {
        self.core.set_prototype_enabled(backend, index, enabled)?;
        self.generator.require_update(false);
        Ok(())
    }

    pub fn tree_settings(&self, index: usize) -> Option<TreeSettings> {
        self.core.data(index).map(|d| d.settings)
    }

    pub fn set_tree_settings(&mut self, index: usize, settings: TreeSettings) -> Result<()> {
        let count = self.core.len();
        let data = self.core.data_mut(index).ok_or(Error::PrototypeIndex { index, count })?;
        if data.settings != settings {
            data.settings = settings;
            self.generator.require_update(false);
        }
        Ok(())
    }

    /// Import every tree prototype the registered terrains reference.
    pub fn add_prototypes_from_terrains(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrains: &TerrainRegistry,
        catalog: &AssetCatalog,
    ) -> Result<usize> {
        let names: Vec<String> = self
            .terrains
            .iter()
            .filter_map(|b| terrains.get(b.terrain))
            .flat_map(|t| t.data().tree_prototypes().to_vec())
            .collect();
        let settings = TreeSettings::from(&self.config);
        let added = self.core.import_prototypes(
            backend,
            names.iter().map(String::as_str),
            catalog,
            || TreePrototypeData { settings },
        )?;
        if added > 0 {
            self.rebuild_index_tables(terrains);
            self.generator.require_update(false);
        }
        Ok(added)
    }

    /// Schedule a regeneration pass; `reload` refetches terrain records.
    pub fn require_update(&mut self, reload: bool) {
        self.generator.require_update(reload);
    }

    fn prototype_infos(&self) -> Vec<TreePrototypeInfo> {
        (0..self.core.len())
            .map(|i| TreePrototypeInfo {
                key: self.core.render_key(i),
                settings: self.core.data(i).map(|d| d.settings).unwrap_or_default(),
                prefab_scale: self
                    .core
                    .prototype(i)
                    .map_or(glam::Vec3::ONE, |p| p.descriptor().prefab_scale()),
            })
            .collect()
    }

    /// Per-frame tick. Delivers finished readbacks, notices moved terrains
    /// and runs a pass when dirty.
    pub fn update(&mut self, backend: &mut dyn RenderBackend, terrains: &mut TerrainRegistry) -> Result<Option<PassStats>> {
        if !self.core.is_initialized() {
            return Ok(None);
        }
        self.core.poll_readbacks(backend);

        let gone: Vec<TerrainId> = self.terrains().filter(|id| !terrains.contains(*id)).collect();
        for id in gone {
            self.remove_terrain(id);
        }
        if self.generator.detect_terrain_changes(terrains, &self.terrains) {
            self.rebuild_index_tables(terrains);
        }
        if !self.generator.is_dirty() {
            return Ok(None);
        }

        let infos = self.prototype_infos();
        let stats = self
            .generator
            .regenerate(backend, terrains, &self.terrains, &infos, self.core.buffers_mut())?;
        Ok(Some(stats))
    }

    pub fn registered_instance_count(&self, index: usize) -> u32 {
        self.core.registered_instance_count(index)
    }

    pub fn request_matrices_async(
        &mut self,
        backend: &mut dyn RenderBackend,
        index: usize,
        callback: impl FnOnce(Result<&[Mat4]>) + 'static,
    ) -> Result<()> {
        self.core.request_matrices_async(backend, index, callback)
    }

    /// Whether the light probes of a prototype need resampling; clears the flag.
    pub fn take_light_probes_stale(&mut self, index: usize) -> bool {
        let key = self.core.render_key(index);
        self.core.buffers_mut().take_light_probes_stale(key)
    }

    pub fn manager_issue(&self, terrains: &TerrainRegistry) -> Option<ManagerIssue> {
        let referenced = self
            .terrains
            .iter()
            .filter_map(|b| terrains.get(b.terrain))
            .any(|t| !t.data().tree_prototypes().is_empty());
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
