//! Tree instance generation.
//!
//! Expands the raw tree records of every registered terrain into world
//! matrices inside the per-prototype transform buffers. Runs only when
//! something changed: `require_update` or a terrain that moved, rotated,
//! toggled or swapped its data. One dispatch per (terrain, prototype) pair;
//! the kernel claims output slots with an atomic counter per prototype, so
//! the order of instances inside a segment is unspecified.

use std::collections::{BTreeMap, HashMap};

use glam::{Quat, Vec3};

use super::transform_buffer::{TransformBufferEntry, TransformBufferManager};
use crate::backend::{
    BufferId, BufferUsage, Dispatch, RenderBackend, RenderKey, TextureId, TreeInstanceParams, TreeKernel,
};
use crate::config::TreeConfig;
use crate::core::logging::LogOnce;
use crate::core::Result;
use crate::terrain::{TerrainId, TerrainRegistry, TreeInstanceRecord};

/// Generator state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GeneratorState {
    #[default]
    Idle,
    Dirty,
    Regenerating,
}

/// Per-prototype placement switches
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TreeSettings {
    pub apply_rotation: bool,
    pub apply_prefab_scale: bool,
    pub height_offset: f32,
}

impl From<&TreeConfig> for TreeSettings {
    fn from(config: &TreeConfig) -> Self {
        Self {
            apply_rotation: config.apply_rotation,
            apply_prefab_scale: config.apply_prefab_scale,
            height_offset: config.height_offset,
        }
    }
}

impl Default for TreeSettings {
    fn default() -> Self {
        Self::from(&TreeConfig::default())
    }
}

/// What the pass needs to know about one manager-level prototype.
#[derive(Clone, Copy, Debug)]
pub struct TreePrototypeInfo {
    /// Zero when the prototype is not bound; such prototypes get nothing
    pub key: RenderKey,
    pub settings: TreeSettings,
    pub prefab_scale: Vec3,
}

/// A terrain and the mapping from its tree prototype table to manager
/// prototype indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeTerrainBinding {
    pub terrain: TerrainId,
    pub index_table: Vec<Option<usize>>,
}

impl TreeTerrainBinding {
    pub fn manager_index(&self, terrain_index: u32) -> Option<usize> {
        self.index_table.get(terrain_index as usize).copied().flatten()
    }
}

/// Counters from one pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassStats {
    pub terrains: usize,
    pub skipped_terrains: usize,
    pub dispatches: usize,
    pub instances: u32,
}

struct CachedTerrain {
    records: Vec<TreeInstanceRecord>,
    position: Vec3,
    rotation: Quat,
    enabled: bool,
    revision: u64,
}

struct TerrainWork {
    terrain: TerrainId,
    heightmap: TextureId,
    heightmap_resolution: u32,
    holes: Option<TextureId>,
    holes_resolution: u32,
    position: Vec3,
    rotation: Quat,
    rotated: bool,
    size: Vec3,
    /// terrain-local prototype index -> manager prototype index
    pairs: BTreeMap<u32, usize>,
}

pub struct TreeInstanceGenerator {
    state: GeneratorState,
    reload: bool,
    requeued: bool,
    sample_holes: bool,
    cache: HashMap<TerrainId, CachedTerrain>,
    tally: Vec<u32>,
    counters: Option<(BufferId, usize)>,
    missing_heightmap: LogOnce<TerrainId>,
    passes: u64,
}

impl TreeInstanceGenerator {
    pub fn new(config: &TreeConfig) -> Self {
        Self {
            state: GeneratorState::Idle,
            reload: false,
            requeued: false,
            sample_holes: config.sample_holes,
            cache: HashMap::new(),
            tally: Vec::new(),
            counters: None,
            missing_heightmap: LogOnce::new(),
            passes: 0,
        }
    }

    pub fn state(&self) -> GeneratorState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.state == GeneratorState::Dirty
    }

    /// Completed passes
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Schedule a pass. `reload` refetches records from every terrain.
    pub fn require_update(&mut self, reload: bool) {
        self.reload |= reload;
        match self.state {
            GeneratorState::Regenerating => self.requeued = true,
            _ => self.state = GeneratorState::Dirty,
        }
    }

    /// Drop cached records of a terrain that left the manager.
    pub fn forget(&mut self, terrain: TerrainId) {
        self.cache.remove(&terrain);
        self.missing_heightmap.clear(&terrain);
    }

    /// Mark dirty when a terrain moved, rotated, was toggled, replaced its
    /// data or has not been seen yet.
    pub fn detect_terrain_changes(&mut self, terrains: &TerrainRegistry, bindings: &[TreeTerrainBinding]) -> bool {
        let mut changed = false;
        for binding in bindings {
            let Some(terrain) = terrains.get(binding.terrain) else {
                continue;
            };
            match self.cache.get(&binding.terrain) {
                Some(cached) => {
                    if cached.revision != terrain.revision() {
                        self.cache.remove(&binding.terrain);
                        changed = true;
                    } else if cached.position != terrain.position
                        || cached.rotation != terrain.rotation
                        || cached.enabled != terrain.enabled
                    {
                        changed = true;
                    }
                }
                None => changed |= terrain.enabled,
            }
        }
        if changed && self.state == GeneratorState::Idle {
            self.state = GeneratorState::Dirty;
        }
        changed
    }

    /// Enter `Regenerating`; returns whether records must be reloaded.
    pub fn begin_pass(&mut self) -> bool {
        self.state = GeneratorState::Regenerating;
        self.requeued = false;
        std::mem::take(&mut self.reload)
    }

    /// Leave `Regenerating`. A request that arrived meanwhile leaves us dirty.
    pub fn finish_pass(&mut self) {
        self.state = if self.requeued {
            GeneratorState::Dirty
        } else {
            GeneratorState::Idle
        };
        self.requeued = false;
        self.passes += 1;
    }

    /// Run one full pass.
    pub fn regenerate(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrains: &mut TerrainRegistry,
        bindings: &[TreeTerrainBinding],
        prototypes: &[TreePrototypeInfo],
        buffers: &mut TransformBufferManager,
    ) -> Result<PassStats> {
        let reload = self.begin_pass();
        let result = self.run_pass(backend, terrains, bindings, prototypes, buffers, reload);
        self.finish_pass();
        if let Ok(stats) = &result {
            log::debug!(
                "Tree pass: {} terrains ({} skipped), {} dispatches, {} instances",
                stats.terrains,
                stats.skipped_terrains,
                stats.dispatches,
                stats.instances
            );
        }
        result
    }

    fn run_pass(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrains: &mut TerrainRegistry,
        bindings: &[TreeTerrainBinding],
        prototypes: &[TreePrototypeInfo],
        buffers: &mut TransformBufferManager,
        reload: bool,
    ) -> Result<PassStats> {
        let mut stats = PassStats::default();
        self.tally.clear();
        self.tally.resize(prototypes.len(), 0);

        // Gather records and tally per manager prototype
        let mut work = Vec::new();
        for binding in bindings {
            let id = binding.terrain;
            let Some(terrain) = terrains.get_mut(id) else {
                continue;
            };
            if !terrain.enabled {
                self.cache.entry(id).and_modify(|c| c.enabled = false);
                continue;
            }
            let Some(heightmap) = terrain.heightmap_texture(backend)? else {
                if self.missing_heightmap.first(id) {
                    log::warn!("Terrain '{}' has no heightmap, skipping its trees", terrain.name());
                }
                stats.skipped_terrains += 1;
                continue;
            };
            self.missing_heightmap.clear(&id);
            let holes = if self.sample_holes {
                terrain.holes_texture(backend)?
            } else {
                None
            };

            let stale = self
                .cache
                .get(&id)
                .is_none_or(|c| c.revision != terrain.revision());
            if reload || stale {
                let records = terrain.data().tree_instances(reload);
                self.cache.insert(
                    id,
                    CachedTerrain {
                        records,
                        position: terrain.position,
                        rotation: terrain.rotation,
                        enabled: true,
                        revision: terrain.revision(),
                    },
                );
            }
            let Some(cached) = self.cache.get_mut(&id) else {
                continue;
            };
            cached.position = terrain.position;
            cached.rotation = terrain.rotation;
            cached.enabled = true;

            let mut pairs = BTreeMap::new();
            for record in &cached.records {
                let Some(p) = binding.manager_index(record.prototype_index) else {
                    continue;
                };
                if prototypes.get(p).is_some_and(|info| info.key.is_some()) {
                    self.tally[p] += 1;
                    pairs.insert(record.prototype_index, p);
                }
            }

            stats.terrains += 1;
            work.push(TerrainWork {
                terrain: id,
                heightmap,
                heightmap_resolution: terrain.heightmap_resolution(),
                holes,
                holes_resolution: terrain.holes_resolution(),
                position: terrain.position,
                rotation: terrain.rotation,
                rotated: terrain.has_rotation(),
                size: terrain.size(),
                pairs,
            });
        }

        // One counter per manager prototype, zeroed every pass
        let counters = self.counter_buffer(backend, prototypes.len())?;
        backend.clear_buffer(counters)?;

        let mut entries: Vec<Option<TransformBufferEntry>> = Vec::with_capacity(prototypes.len());
        for (p, info) in prototypes.iter().enumerate() {
            if info.key.is_none() {
                entries.push(None);
                continue;
            }
            entries.push(Some(buffers.ensure_capacity(backend, info.key, self.tally[p])?));
        }

        for item in work.iter().filter(|w| !w.pairs.is_empty()) {
            let Some(cached) = self.cache.get(&item.terrain) else {
                continue;
            };
            let bytes: &[u8] = bytemuck::cast_slice(&cached.records);
            let records = backend.create_buffer("tree records", BufferUsage::Records, bytes.len() as u64);
            let result = backend.write_buffer(records, 0, bytes).and_then(|()| {
                dispatch_pairs(backend, item, cached.records.len() as u32, records, counters, &entries, prototypes)
            });
            // Submitted; the backend keeps it alive until the work retires.
            backend.release_buffer(records);
            stats.dispatches += result?;
        }

        for (p, info) in prototypes.iter().enumerate() {
            if info.key.is_none() {
                continue;
            }
            buffers.set_instance_count(backend, info.key, self.tally[p])?;
            buffers.mark_light_probes_stale(info.key);
            stats.instances += self.tally[p];
        }
        self.tally.iter_mut().for_each(|t| *t = 0);
        Ok(stats)
    }

    fn counter_buffer(&mut self, backend: &mut dyn RenderBackend, slots: usize) -> Result<BufferId> {
        let slots = slots.max(1);
        if let Some((buffer, have)) = self.counters {
            if have >= slots {
                return Ok(buffer);
            }
            backend.release_buffer(buffer);
        }
        let buffer = backend.create_buffer("tree counters", BufferUsage::Counters, slots as u64 * 4);
        self.counters = Some((buffer, slots));
        Ok(buffer)
    }

    /// Release GPU state and forget every cached terrain.
    pub fn release(&mut self, backend: &mut dyn RenderBackend) {
        if let Some((buffer, _)) = self.counters.take() {
            backend.release_buffer(buffer);
        }
        self.cache.clear();
        self.missing_heightmap = LogOnce::new();
        self.state = GeneratorState::Idle;
        self.reload = false;
        self.requeued = false;
    }
}

/// One dispatch per terrain-prototype pair of `item`. Returns the dispatch count.
fn dispatch_pairs(
    backend: &mut dyn RenderBackend,
    item: &TerrainWork,
    record_count: u32,
    records: BufferId,
    counters: BufferId,
    entries: &[Option<TransformBufferEntry>],
    prototypes: &[TreePrototypeInfo],
) -> Result<usize> {
    let kernel = TreeKernel::select(item.holes.is_some(), item.rotated);
    let mut dispatches = 0;
    for (&terrain_index, &p) in &item.pairs {
        let (Some(entry), Some(info)) = (entries[p], prototypes.get(p)) else {
            continue;
        };
        let params = TreeInstanceParams {
            terrain_position: item.position.to_array(),
            record_count,
            terrain_size: item.size.to_array(),
            heightmap_resolution: item.heightmap_resolution,
            terrain_rotation: item.rotation.to_array(),
            prefab_scale: info.prefab_scale.to_array(),
            terrain_prototype_index: terrain_index,
            start_index: entry.start_index,
            capacity: entry.capacity,
            apply_rotation: u32::from(info.settings.apply_rotation),
            apply_prefab_scale: u32::from(info.settings.apply_prefab_scale),
            holes_resolution: item.holes_resolution,
            counter_slot: p as u32,
            height_offset: info.settings.height_offset,
            _pad: 0,
        };
        backend.dispatch(&Dispatch::TreeInstances {
            kernel,
            params,
            records,
            heightmap: item.heightmap,
            holes: item.holes,
            counters,
            output: entry.buffer,
        })?;
        dispatches += 1;
    }
    Ok(dispatches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MeshAsset;
    use crate::backend::HostBackend;
    use crate::config::BufferConfig;
    use crate::prototype::{InstanceProfile, Prototype, PrototypeDescriptor};
    use crate::terrain::{Heightmap, HolesMask, Terrain, TerrainAsset};
    use glam::Mat4;
    use std::sync::Arc;

    struct Fixture {
        backend: HostBackend,
        terrains: TerrainRegistry,
        buffers: TransformBufferManager,
        generator: TreeInstanceGenerator,
        prototypes: Vec<TreePrototypeInfo>,
    }

    fn fixture(prototype_count: usize) -> Fixture {
        let mut backend = HostBackend::new();
        let mesh = Arc::new(MeshAsset::new("tree"));
        let proto = Prototype::new(PrototypeDescriptor::from_mesh(&mesh, &[]), InstanceProfile::default());
        let prototypes = (0..prototype_count)
            .map(|_| TreePrototypeInfo {
                key: backend.register_render_source(&proto).unwrap(),
                settings: TreeSettings::default(),
                prefab_scale: Vec3::ONE,
            })
            .collect();
        Fixture {
            backend,
            terrains: TerrainRegistry::new(),
            buffers: TransformBufferManager::new(BufferConfig::default()),
            generator: TreeInstanceGenerator::new(&TreeConfig::default()),
            prototypes,
        }
    }

    fn terrain_with(records: Vec<TreeInstanceRecord>, protos: &[&str]) -> TerrainAsset {
        let mut asset = TerrainAsset::new("t", Vec3::new(100.0, 10.0, 100.0)).with_heightmap(Heightmap::flat(4, 0.0));
        for p in protos {
            asset.add_tree_prototype(*p);
        }
        asset.trees = records;
        asset
    }

    impl Fixture {
        fn run(&mut self, bindings: &[TreeTerrainBinding]) -> PassStats {
            self.generator
                .regenerate(
                    &mut self.backend,
                    &mut self.terrains,
                    bindings,
                    &self.prototypes,
                    &mut self.buffers,
                )
                .unwrap()
        }

        fn count(&self, p: usize) -> u32 {
            self.buffers.instance_count(self.prototypes[p].key)
        }

        fn matrices(&self, p: usize) -> Vec<Mat4> {
            let e = self.buffers.entry(self.prototypes[p].key).unwrap();
            self.backend.read_matrices(e.buffer, e.start_index, e.instance_count).unwrap()
        }
    }

    #[test]
    fn test_two_terrains_one_empty() {
        let mut f = fixture(1);
        let a = f.terrains.insert(Terrain::new(terrain_with(
            vec![TreeInstanceRecord::new(0.1, 0.1, 0); 3],
            &["oak"],
        )));
        let b = f.terrains.insert(Terrain::new(terrain_with(Vec::new(), &["oak"])));
        let bindings = vec![
            TreeTerrainBinding { terrain: a, index_table: vec![Some(0)] },
            TreeTerrainBinding { terrain: b, index_table: vec![Some(0)] },
        ];
        let stats = f.run(&bindings);
        assert_eq!(f.count(0), 3);
        assert_eq!(stats.terrains, 2);
        assert_eq!(stats.dispatches, 1);
        let e = f.buffers.entry(f.prototypes[0].key).unwrap();
        assert!(e.capacity >= e.instance_count);
    }

    #[test]
    fn test_unmapped_indices_dropped() {
        let mut f = fixture(2);
        let records = vec![
            TreeInstanceRecord::new(0.5, 0.5, 0),
            TreeInstanceRecord::new(0.5, 0.5, 1),
            TreeInstanceRecord::new(0.5, 0.5, 7),
        ];
        let t = f.terrains.insert(Terrain::new(terrain_with(records, &["oak", "ghost"])));
        // Terrain prototype 1 maps nowhere; 7 is out of the table
        let bindings = vec![TreeTerrainBinding { terrain: t, index_table: vec![Some(1), None] }];
        f.run(&bindings);
        assert_eq!(f.count(0), 0);
        assert_eq!(f.count(1), 1);
    }

    #[test]
    fn test_segments_from_several_terrains_append() {
        let mut f = fixture(1);
        let a = f.terrains.insert(Terrain::new(terrain_with(vec![TreeInstanceRecord::new(0.0, 0.0, 0); 2], &["oak"])));
        let b = f.terrains.insert(
            Terrain::new(terrain_with(vec![TreeInstanceRecord::new(0.0, 0.0, 0); 3], &["oak"]))
                .with_position(Vec3::new(1000.0, 0.0, 0.0)),
        );
        let bindings = vec![
            TreeTerrainBinding { terrain: a, index_table: vec![Some(0)] },
            TreeTerrainBinding { terrain: b, index_table: vec![Some(0)] },
        ];
        f.run(&bindings);
        let xs: Vec<f32> = f.matrices(0).iter().map(|m| m.w_axis.x).collect();
        assert_eq!(xs.len(), 5);
        assert_eq!(xs.iter().filter(|&&x| x == 0.0).count(), 2);
        assert_eq!(xs.iter().filter(|&&x| x == 1000.0).count(), 3);
    }

    #[test]
    fn test_holes_write_zero_matrices() {
        let mut f = fixture(1);
        let mut holes = HolesMask::solid(2);
        holes.set_hole(0, 0);
        let asset = terrain_with(
            vec![TreeInstanceRecord::new(0.1, 0.1, 0), TreeInstanceRecord::new(0.9, 0.9, 0)],
            &["oak"],
        )
        .with_holes(holes);
        let t = f.terrains.insert(Terrain::new(asset));
        f.run(&[TreeTerrainBinding { terrain: t, index_table: vec![Some(0)] }]);
        assert_eq!(f.count(0), 2);
        let m = f.matrices(0);
        assert_eq!(m.iter().filter(|m| **m == Mat4::ZERO).count(), 1);
    }

    #[test]
    fn test_missing_heightmap_skips_terrain() {
        let mut f = fixture(1);
        let mut bare = terrain_with(vec![TreeInstanceRecord::new(0.5, 0.5, 0)], &["oak"]);
        bare.heightmap = None;
        let bad = f.terrains.insert(Terrain::new(bare));
        let good = f.terrains.insert(Terrain::new(terrain_with(vec![TreeInstanceRecord::new(0.5, 0.5, 0)], &["oak"])));
        let bindings = vec![
            TreeTerrainBinding { terrain: bad, index_table: vec![Some(0)] },
            TreeTerrainBinding { terrain: good, index_table: vec![Some(0)] },
        ];
        let stats = f.run(&bindings);
        assert_eq!(stats.skipped_terrains, 1);
        assert_eq!(f.count(0), 1);
    }

    #[test]
    fn test_disabled_terrain_contributes_nothing() {
        let mut f = fixture(1);
        let t = f.terrains.insert(Terrain::new(terrain_with(vec![TreeInstanceRecord::new(0.5, 0.5, 0); 4], &["oak"])));
        let bindings = vec![TreeTerrainBinding { terrain: t, index_table: vec![Some(0)] }];
        f.run(&bindings);
        assert_eq!(f.count(0), 4);

        f.terrains.get_mut(t).unwrap().enabled = false;
        assert!(f.generator.detect_terrain_changes(&f.terrains, &bindings));
        f.run(&bindings);
        assert_eq!(f.count(0), 0);
        assert!(f.buffers.entry(f.prototypes[0].key).unwrap().capacity >= 1);
    }

    #[test]
    fn test_state_machine_requeue() {
        let mut g = TreeInstanceGenerator::new(&TreeConfig::default());
        assert_eq!(g.state(), GeneratorState::Idle);
        g.require_update(true);
        assert_eq!(g.state(), GeneratorState::Dirty);

        assert!(g.begin_pass());
        assert_eq!(g.state(), GeneratorState::Regenerating);
        g.require_update(false);
        assert_eq!(g.state(), GeneratorState::Regenerating);
        g.finish_pass();
        assert_eq!(g.state(), GeneratorState::Dirty);

        assert!(!g.begin_pass());
        g.finish_pass();
        assert_eq!(g.state(), GeneratorState::Idle);
        assert_eq!(g.passes(), 2);
    }

    #[test]
    fn test_detects_moves_and_uses_cache() {
        let mut f = fixture(1);
        let t = f.terrains.insert(Terrain::new(terrain_with(vec![TreeInstanceRecord::new(0.5, 0.5, 0)], &["oak"])));
        let bindings = vec![TreeTerrainBinding { terrain: t, index_table: vec![Some(0)] }];
        assert!(f.generator.detect_terrain_changes(&f.terrains, &bindings));
        f.run(&bindings);
        assert!(!f.generator.detect_terrain_changes(&f.terrains, &bindings));

        f.terrains.get_mut(t).unwrap().position = Vec3::new(0.0, 5.0, 0.0);
        assert!(f.generator.detect_terrain_changes(&f.terrains, &bindings));
        assert!(f.generator.is_dirty());
        f.run(&bindings);
        assert_eq!(f.matrices(0)[0].w_axis.y, 5.0);
    }

    #[test]
    fn test_failed_dispatch_releases_record_buffer() {
        let mut f = fixture(1);
        let t = f.terrains.insert(Terrain::new(terrain_with(vec![TreeInstanceRecord::new(0.5, 0.5, 0); 2], &["oak"])));
        let bindings = vec![TreeTerrainBinding { terrain: t, index_table: vec![Some(0)] }];
        f.run(&bindings);
        let live = f.backend.live_buffers();

        // The terrain still hands out the released heightmap
        let heightmap = f.terrains.get_mut(t).unwrap().heightmap_texture(&mut f.backend).unwrap().unwrap();
        f.backend.release_texture(heightmap);
        f.generator.require_update(false);
        let result = f.generator.regenerate(
            &mut f.backend,
            &mut f.terrains,
            &bindings,
            &f.prototypes,
            &mut f.buffers,
        );
        assert!(result.is_err());
        assert_eq!(f.backend.live_buffers(), live);
        assert_eq!(f.generator.state(), GeneratorState::Idle);
    }
}
