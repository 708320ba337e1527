//! Asset references consumed by prototypes.
//!
//! Mesh, material, shader and prefab authoring live outside this crate. What
//! the pipeline needs from them is captured here: enough structure to
//! validate a prototype and to compute its bounds and scale. Assets are
//! shared through `Arc`; prototypes hold `Weak` references so that dropping
//! the last strong reference prunes the prototype on the next change check.

use std::collections::HashMap;
use std::sync::Arc;

use glam::Vec3;

use crate::config::RenderPipelineKind;
use crate::math::Aabb;
use crate::prototype::PrototypeDescriptor;

/// Mesh reference
#[derive(Debug, Clone)]
pub struct MeshAsset {
    pub name: String,
    /// Local-space bounds
    pub bounds: Aabb,
    pub submesh_count: u32,
}

impl MeshAsset {
    /// Mesh with unit-cube bounds centered on the origin
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bounds: Aabb::from_center_half_extent(Vec3::ZERO, Vec3::splat(0.5)),
            submesh_count: 1,
        }
    }

    pub fn with_bounds(mut self, bounds: Aabb) -> Self {
        self.bounds = bounds;
        self
    }
}

/// Shader reference with its pipeline compatibility.
#[derive(Debug, Clone)]
pub struct ShaderAsset {
    pub name: String,
    /// Render pipelines the shader's properties are authored for
    pub supported_pipelines: Vec<RenderPipelineKind>,
    /// Instancing-capable variant; conversion fails without one
    pub instanced_variant: Option<String>,
}

impl ShaderAsset {
    /// Shader that works everywhere and has an instanced variant
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            instanced_variant: Some(format!("{name}/Instanced")),
            name,
            supported_pipelines: vec![
                RenderPipelineKind::Builtin,
                RenderPipelineKind::Universal,
                RenderPipelineKind::HighDefinition,
            ],
        }
    }

    pub fn supports(&self, pipeline: RenderPipelineKind) -> bool {
        self.supported_pipelines.contains(&pipeline)
    }

    pub fn is_convertible(&self) -> bool {
        self.instanced_variant.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct MaterialAsset {
    pub name: String,
    pub shader: Option<Arc<ShaderAsset>>,
}

impl MaterialAsset {
    pub fn new(name: impl Into<String>, shader: Arc<ShaderAsset>) -> Self {
        Self {
            name: name.into(),
            shader: Some(shader),
        }
    }
}

/// One mesh renderer inside a prefab
#[derive(Debug, Clone, Default)]
pub struct RendererAsset {
    pub mesh: Option<Arc<MeshAsset>>,
    pub materials: Vec<Option<Arc<MaterialAsset>>>,
}

impl RendererAsset {
    pub fn new(mesh: Arc<MeshAsset>, materials: &[Arc<MaterialAsset>]) -> Self {
        Self {
            mesh: Some(mesh),
            materials: materials.iter().cloned().map(Some).collect(),
        }
    }
}

/// LOD group: renderer indices per level
#[derive(Debug, Clone, Default)]
pub struct LodGroupAsset {
    pub levels: Vec<Vec<usize>>,
}

/// Prefab reference: renderers, LOD groups and root scale.
#[derive(Debug, Clone)]
pub struct PrefabAsset {
    pub name: String,
    pub renderers: Vec<RendererAsset>,
    /// More than one group means LOD groups are nested in the hierarchy
    pub lod_groups: Vec<LodGroupAsset>,
    pub scale: Vec3,
}

impl PrefabAsset {
    pub fn new(name: impl Into<String>, renderers: Vec<RendererAsset>) -> Self {
        Self {
            name: name.into(),
            renderers,
            lod_groups: Vec::new(),
            scale: Vec3::ONE,
        }
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    /// Union of renderer mesh bounds, scaled by the root scale
    pub fn bounds(&self) -> Option<Aabb> {
        let mut iter = self.renderers.iter().filter_map(|r| r.mesh.as_ref());
        let first = iter.next()?.bounds;
        let merged = iter.fold(first, |acc, m| acc.merged(&m.bounds));
        Some(Aabb::new(merged.min * self.scale, merged.max * self.scale))
    }
}

/// Named assets available for import, e.g. when pulling prototypes from a
/// terrain's prototype tables.
#[derive(Default)]
pub struct AssetCatalog {
    prefabs: HashMap<String, Arc<PrefabAsset>>,
    meshes: HashMap<String, (Arc<MeshAsset>, Vec<Arc<MaterialAsset>>)>,
}

impl AssetCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_prefab(&mut self, prefab: Arc<PrefabAsset>) {
        self.prefabs.insert(prefab.name.clone(), prefab);
    }

    pub fn insert_mesh(&mut self, mesh: Arc<MeshAsset>, materials: Vec<Arc<MaterialAsset>>) {
        self.meshes.insert(mesh.name.clone(), (mesh, materials));
    }

    pub fn prefab(&self, name: &str) -> Option<&Arc<PrefabAsset>> {
        self.prefabs.get(name)
    }

    /// Descriptor for a named asset; prefabs shadow meshes of the same name.
    pub fn descriptor(&self, name: &str) -> Option<PrototypeDescriptor> {
        if let Some(prefab) = self.prefabs.get(name) {
            return Some(PrototypeDescriptor::from_prefab(prefab));
        }
        self.meshes
            .get(name)
            .map(|(mesh, materials)| PrototypeDescriptor::from_mesh(mesh, materials))
    }

    pub fn len(&self) -> usize {
        self.prefabs.len() + self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
