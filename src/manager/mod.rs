//! Manager lifecycle.
//!
//! `ManagerCore` is shared by the tree and detail managers. It keeps the
//! prototype registry, the render bindings, the transform buffers and the
//! manager's own per-prototype data in lockstep: every index refers to the
//! same prototype in all four, and removal compacts all four in one call.

pub mod detail_manager;
pub mod tree_manager;

pub use detail_manager::{DetailManager, DetailParams, DetailPrototypeData, DetailTerrain};
pub use tree_manager::{TreeManager, TreePrototypeData};

use std::fmt;

use glam::Mat4;

use crate::assets::AssetCatalog;
use crate::backend::{RenderBackend, RenderKey};
use crate::config::InstancingConfig;
use crate::core::{Error, Result};
use crate::instancing::{TransformBufferEntry, TransformBufferManager};
use crate::prototype::{InstanceProfile, Prototype, PrototypeDescriptor, PrototypeRegistry, RenderBindings};

/// GPU-side state a manager keeps per prototype.
pub trait PrototypeData {
    /// Allocate device resources. Called when the prototype becomes live.
    fn prepare(&mut self, _backend: &mut dyn RenderBackend) -> Result<()> {
        Ok(())
    }

    /// Release device resources. Must tolerate repeated calls.
    fn release(&mut self, _backend: &mut dyn RenderBackend) {}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ManagerState {
    #[default]
    Uninitialized,
    Initialized,
}

/// Automatic repair for a manager issue
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerFix {
    /// Add every prototype the registered terrains reference
    ImportTerrainPrototypes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerIssueKind {
    NoPrototypes,
    NoTerrains,
    AllPrototypesInvalid,
}

/// Manager-level problem with an optional fix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerIssue {
    pub kind: ManagerIssueKind,
    pub message: String,
    pub fix: Option<ManagerFix>,
}

impl ManagerIssue {
    pub fn code(&self) -> u32 {
        match self.kind {
            ManagerIssueKind::NoPrototypes => 1,
            ManagerIssueKind::NoTerrains => 2,
            ManagerIssueKind::AllPrototypesInvalid => 3,
        }
    }
}

impl fmt::Display for ManagerIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (issue {})", self.message, self.code())
    }
}

/// Prototype lifecycle shared by the managers.
pub struct ManagerCore<D> {
    label: &'static str,
    registry: PrototypeRegistry,
    bindings: RenderBindings,
    buffers: TransformBufferManager,
    data: Vec<D>,
    state: ManagerState,
    allocate_buffers: bool,
}

impl<D: PrototypeData> ManagerCore<D> {
    /// `allocate_buffers` gives every bound prototype a transform buffer.
    pub fn new(label: &'static str, config: &InstancingConfig, allocate_buffers: bool) -> Self {
        Self {
            label,
            registry: PrototypeRegistry::new(config.render_pipeline),
            bindings: RenderBindings::new(),
            buffers: TransformBufferManager::new(config.buffers.clone()),
            data: Vec::new(),
            state: ManagerState::Uninitialized,
            allocate_buffers,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == ManagerState::Initialized
    }

    /// Validate, prune and bind every prototype. Idempotent.
    pub fn initialize(&mut self, backend: &mut dyn RenderBackend) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        self.state = ManagerState::Initialized;
        self.check_prototype_changes(backend)?;
        log::info!(
            "{} manager initialized on {} backend with {} prototypes",
            self.label,
            backend.name(),
            self.registry.len()
        );
        Ok(())
    }

    /// Unbind everything and release all device state. Idempotent.
    pub fn dispose(&mut self, backend: &mut dyn RenderBackend) {
        if !self.is_initialized() {
            return;
        }
        for index in 0..self.registry.len() {
            self.unbind(backend, index);
            self.data[index].release(backend);
        }
        self.buffers.release_all(backend);
        self.state = ManagerState::Uninitialized;
        log::info!("{} manager disposed", self.label);
    }

    fn bind(&mut self, backend: &mut dyn RenderBackend, index: usize) -> Result<RenderKey> {
        if !self.is_initialized() {
            return Ok(RenderKey::NONE);
        }
        let Some(prototype) = self.registry.get(index) else {
            return Ok(RenderKey::NONE);
        };
        let key = self.bindings.ensure_registered(backend, index, prototype)?;
        if key.is_some() {
            if self.allocate_buffers {
                self.buffers.ensure_capacity(backend, key, 0)?;
            }
            self.data[index].prepare(backend)?;
        }
        Ok(key)
    }

    fn unbind(&mut self, backend: &mut dyn RenderBackend, index: usize) {
        let key = self.bindings.key(index);
        self.buffers.release(backend, key);
        self.bindings.dispose(backend, index);
    }

    /// Validate and append a prototype; binds it right away when initialized.
    pub fn add_prototype(
        &mut self,
        backend: &mut dyn RenderBackend,
        descriptor: PrototypeDescriptor,
        profile: InstanceProfile,
        data: D,
    ) -> Result<usize> {
        let index = self.registry.add(descriptor, profile)?;
        self.bindings.push();
        self.data.push(data);
        self.bind(backend, index)?;
        log::info!("{} manager: added prototype '{}' at {index}", self.label, self.prototype_name(index));
        Ok(index)
    }

    /// Unbind, release and remove the prototype at `index`. Later indices shift down.
    pub fn remove_prototype_at(&mut self, backend: &mut dyn RenderBackend, index: usize) -> Result<()> {
        self.registry.check_index(index)?;
        self.unbind(backend, index);
        self.data[index].release(backend);
        let removed = self.registry.remove_at(index)?;
        self.bindings.remove(index);
        self.data.remove(index);
        log::info!("{} manager: removed prototype '{}'", self.label, removed.name());
        Ok(())
    }

    /// Prune prototypes whose asset is gone, re-validate the rest and bring
    /// bindings in line. Returns how many were pruned.
    pub fn check_prototype_changes(&mut self, backend: &mut dyn RenderBackend) -> Result<usize> {
        let mut pruned = 0;
        while let Some(index) = self.registry.first_null() {
            log::info!(
                "{} manager: pruning prototype '{}', its asset was dropped",
                self.label,
                self.prototype_name(index)
            );
            self.remove_prototype_at(backend, index)?;
            pruned += 1;
        }
        self.bindings.resize(self.registry.len());

        for index in 0..self.registry.len() {
            let valid = self.registry.revalidate(index).is_none();
            let enabled = self.registry.get(index).is_some_and(|p| p.enabled);
            if valid && enabled {
                self.bind(backend, index)?;
            } else if self.bindings.state(index).is_bound() {
                self.unbind(backend, index);
                self.data[index].release(backend);
            }
        }
        Ok(pruned)
    }

    /// Enable or disable a prototype; while initialized this is a
    /// register/dispose.
    pub fn set_prototype_enabled(&mut self, backend: &mut dyn RenderBackend, index: usize, enabled: bool) -> Result<()> {
        self.registry.check_index(index)?;
        if let Some(p) = self.registry.get_mut(index) {
            p.enabled = enabled;
        }
        if enabled {
            self.bind(backend, index)?;
        } else {
            self.unbind(backend, index);
            self.data[index].release(backend);
        }
        Ok(())
    }

    /// Add every named asset the manager does not have yet. Unknown names
    /// and rejected prototypes are logged and skipped.
    pub fn import_prototypes<'a>(
        &mut self,
        backend: &mut dyn RenderBackend,
        names: impl IntoIterator<Item = &'a str>,
        catalog: &AssetCatalog,
        mut make_data: impl FnMut() -> D,
    ) -> Result<usize> {
        let mut added = 0;
        for name in names {
            if self.registry.index_of(name).is_some() {
                continue;
            }
            let Some(descriptor) = catalog.descriptor(name) else {
                log::warn!("{} manager: no asset named '{name}' to import", self.label);
                continue;
            };
            match self.add_prototype(backend, descriptor, InstanceProfile::default(), make_data()) {
                Ok(_) => added += 1,
                Err(Error::Prototype(e)) => log::warn!("{} manager: '{name}' not imported: {e}", self.label),
                Err(e) => return Err(e),
            }
        }
        Ok(added)
    }

    pub fn prototype(&self, index: usize) -> Option<&Prototype> {
        self.registry.get(index)
    }

    fn prototype_name(&self, index: usize) -> String {
        self.registry.get(index).map(|p| p.name().to_string()).unwrap_or_default()
    }

    pub fn prototypes(&self) -> &[Prototype] {
        self.registry.as_slice()
    }

    pub fn registry(&self) -> &PrototypeRegistry {
        &self.registry
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.registry.index_of(name)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn render_key(&self, index: usize) -> RenderKey {
        self.bindings.key(index)
    }

    pub fn buffer_entry(&self, index: usize) -> Option<TransformBufferEntry> {
        self.buffers.entry(self.render_key(index))
    }

    /// Instances the draw system renders for the prototype
    pub fn registered_instance_count(&self, index: usize) -> u32 {
        self.buffers.instance_count(self.render_key(index))
    }

    pub fn data(&self, index: usize) -> Option<&D> {
        self.data.get(index)
    }

    pub fn data_mut(&mut self, index: usize) -> Option<&mut D> {
        self.data.get_mut(index)
    }

    pub fn buffers(&self) -> &TransformBufferManager {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut TransformBufferManager {
        &mut self.buffers
    }

    pub fn valid_count(&self) -> usize {
        self.registry.iter().filter(|p| p.is_valid()).count()
    }

    /// First manager-level problem, if any. `terrains_reference` tells
    /// whether the manager's terrains name prototypes that could be imported.
    pub fn issue(&self, terrain_count: usize, terrains_reference: bool) -> Option<ManagerIssue> {
        let (kind, message, fix) = if self.registry.is_empty() {
            (
                ManagerIssueKind::NoPrototypes,
                format!("{} manager has no prototypes", self.label),
                terrains_reference.then_some(ManagerFix::ImportTerrainPrototypes),
            )
        } else if terrain_count == 0 {
            (ManagerIssueKind::NoTerrains, format!("{} manager has no terrains", self.label), None)
        } else if self.valid_count() == 0 {
            (
                ManagerIssueKind::AllPrototypesInvalid,
                format!("every {} prototype failed validation", self.label),
                None,
            )
        } else {
            return None;
        };
        Some(ManagerIssue { kind, message, fix })
    }

    pub fn request_matrices_async(
        &mut self,
        backend: &mut dyn RenderBackend,
        index: usize,
        callback: impl FnOnce(Result<&[Mat4]>) + 'static,
    ) -> Result<()> {
        self.registry.check_index(index)?;
        let key = self.render_key(index);
        self.buffers.request_matrices_async(backend, key, callback)
    }

    pub fn poll_readbacks(&mut self, backend: &mut dyn RenderBackend) -> usize {
        self.buffers.poll_readbacks(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{MaterialAsset, MeshAsset, ShaderAsset};
    use crate::backend::HostBackend;
    use std::sync::Arc;

    #[derive(Default)]
    struct Counter {
        prepared: u32,
        released: u32,
    }

    impl PrototypeData for Counter {
        fn prepare(&mut self, _backend: &mut dyn RenderBackend) -> Result<()> {
            self.prepared += 1;
            Ok(())
        }

        fn release(&mut self, _backend: &mut dyn RenderBackend) {
            self.released += 1;
        }
    }

    struct Assets {
        meshes: Vec<Arc<MeshAsset>>,
        material: Arc<MaterialAsset>,
    }

    impl Assets {
        fn new(names: &[&str]) -> Self {
            Self {
                meshes: names.iter().map(|n| Arc::new(MeshAsset::new(*n))).collect(),
                material: Arc::new(MaterialAsset::new("mat", Arc::new(ShaderAsset::new("Lit")))),
            }
        }

        fn descriptor(&self, i: usize) -> PrototypeDescriptor {
            PrototypeDescriptor::from_mesh(&self.meshes[i], &[self.material.clone()])
        }
    }

    fn core_with(assets: &Assets, backend: &mut HostBackend) -> ManagerCore<Counter> {
        let mut core = ManagerCore::new("test", &InstancingConfig::default(), true);
        for i in 0..assets.meshes.len() {
            core.add_prototype(backend, assets.descriptor(i), InstanceProfile::default(), Counter::default())
                .unwrap();
        }
        core
    }

    #[test]
    fn test_initialize_binds_and_dispose_releases() {
        let assets = Assets::new(&["a", "b"]);
        let mut backend = HostBackend::new();
        let mut core = core_with(&assets, &mut backend);
        assert!(core.render_key(0).is_none());

        core.initialize(&mut backend).unwrap();
        core.initialize(&mut backend).unwrap();
        assert!(core.render_key(0).is_some() && core.render_key(1).is_some());
        assert_eq!(backend.live_sources(), 2);
        assert_eq!(core.buffer_entry(0).unwrap().capacity, 1);
        assert_eq!(core.data(0).unwrap().prepared, 1);

        core.dispose(&mut backend);
        core.dispose(&mut backend);
        assert!(core.render_key(0).is_none());
        assert_eq!(backend.live_sources(), 0);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(core.data(1).unwrap().released, 1);
        assert_eq!(core.len(), 2);
    }

    #[test]
    fn test_check_prototype_changes_idempotent() {
        let assets = Assets::new(&["a", "b", "c"]);
        let mut backend = HostBackend::new();
        let mut core = core_with(&assets, &mut backend);
        core.initialize(&mut backend).unwrap();

        let keys: Vec<_> = (0..3).map(|i| core.render_key(i)).collect();
        assert_eq!(core.check_prototype_changes(&mut backend).unwrap(), 0);
        assert_eq!(core.check_prototype_changes(&mut backend).unwrap(), 0);
        let again: Vec<_> = (0..3).map(|i| core.render_key(i)).collect();
        assert_eq!(keys, again);
        let names: Vec<_> = core.prototypes().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_shifts_and_preserves_key_and_buffer() {
        let assets = Assets::new(&["a", "b", "c"]);
        let mut backend = HostBackend::new();
        let mut core = core_with(&assets, &mut backend);
        core.initialize(&mut backend).unwrap();
        let key_c = core.render_key(2);
        let buf_c = core.buffer_entry(2).unwrap().buffer;
        let key_b = core.render_key(1);

        core.remove_prototype_at(&mut backend, 1).unwrap();
        assert_eq!(core.len(), 2);
        assert_eq!(core.prototype(1).unwrap().name(), "c");
        assert_eq!(core.render_key(1), key_c);
        assert_eq!(core.buffer_entry(1).unwrap().buffer, buf_c);
        assert_eq!(backend.instance_count(key_b), None);
        assert!(core.remove_prototype_at(&mut backend, 2).is_err());
    }

    #[test]
    fn test_prunes_dropped_assets() {
        let mut assets = Assets::new(&["a", "b", "c"]);
        let mut backend = HostBackend::new();
        let mut core = core_with(&assets, &mut backend);
        core.initialize(&mut backend).unwrap();

        assets.meshes.remove(0);
        assets.meshes.remove(1);
        assert_eq!(core.check_prototype_changes(&mut backend).unwrap(), 2);
        assert_eq!(core.len(), 1);
        assert_eq!(core.prototype(0).unwrap().name(), "b");
        assert_eq!(backend.live_sources(), 1);
    }

    #[test]
    fn test_invalidated_prototype_is_unbound() {
        let mut assets = Assets::new(&["a"]);
        let mut backend = HostBackend::new();
        let mut core = core_with(&assets, &mut backend);
        core.initialize(&mut backend).unwrap();
        assert!(core.render_key(0).is_some());

        // Material dropped: mesh still alive, prototype invalid
        assets.material = Arc::new(MaterialAsset::new("other", Arc::new(ShaderAsset::new("Lit"))));
        core.check_prototype_changes(&mut backend).unwrap();
        assert_eq!(core.len(), 1);
        assert!(core.render_key(0).is_none());
        assert!(core.prototype(0).unwrap().error().is_some());
        assert_eq!(core.valid_count(), 0);
    }

    #[test]
    fn test_enable_toggle_is_dispose_register() {
        let assets = Assets::new(&["a"]);
        let mut backend = HostBackend::new();
        let mut core = core_with(&assets, &mut backend);
        core.initialize(&mut backend).unwrap();

        core.set_prototype_enabled(&mut backend, 0, false).unwrap();
        assert!(core.render_key(0).is_none());
        assert_eq!(backend.live_sources(), 0);
        assert!(core.buffer_entry(0).is_none());

        core.set_prototype_enabled(&mut backend, 0, true).unwrap();
        assert!(core.render_key(0).is_some());
        assert_eq!(backend.live_sources(), 1);
    }

    #[test]
    fn test_add_when_uninitialized_does_not_bind() {
        let assets = Assets::new(&["a"]);
        let mut backend = HostBackend::new();
        let core = core_with(&assets, &mut backend);
        assert_eq!(backend.live_sources(), 0);
        assert_eq!(core.registered_instance_count(0), 0);
    }
}
