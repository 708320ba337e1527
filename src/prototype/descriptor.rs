//! What a prototype is made of.

use std::sync::{Arc, Weak};

use glam::Vec3;

use crate::assets::{MaterialAsset, MeshAsset, PrefabAsset};
use crate::math::Aabb;

/// Backing asset reference. Held weakly; see `PrototypeDescriptor::is_null`.
#[derive(Clone, Debug)]
pub enum PrototypeSource {
    Mesh {
        mesh: Weak<MeshAsset>,
        materials: Vec<Weak<MaterialAsset>>,
    },
    Prefab(Weak<PrefabAsset>),
}

/// Identity of a prototype: the asset it renders.
#[derive(Clone, Debug)]
pub struct PrototypeDescriptor {
    name: String,
    source: PrototypeSource,
}

impl PrototypeDescriptor {
    pub fn from_mesh(mesh: &Arc<MeshAsset>, materials: &[Arc<MaterialAsset>]) -> Self {
        Self {
            name: mesh.name.clone(),
            source: PrototypeSource::Mesh {
                mesh: Arc::downgrade(mesh),
                materials: materials.iter().map(Arc::downgrade).collect(),
            },
        }
    }

    pub fn from_prefab(prefab: &Arc<PrefabAsset>) -> Self {
        Self {
            name: prefab.name.clone(),
            source: PrototypeSource::Prefab(Arc::downgrade(prefab)),
        }
    }

    /// Asset name, kept even after the asset is gone
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &PrototypeSource {
        &self.source
    }

    pub fn is_prefab(&self) -> bool {
        matches!(self.source, PrototypeSource::Prefab(_))
    }

    /// The backing mesh or prefab has been dropped.
    pub fn is_null(&self) -> bool {
        match &self.source {
            PrototypeSource::Mesh { mesh, .. } => mesh.strong_count() == 0,
            PrototypeSource::Prefab(prefab) => prefab.strong_count() == 0,
        }
    }

    /// Both descriptors point at the same assets.
    pub fn same_asset(&self, other: &PrototypeDescriptor) -> bool {
        match (&self.source, &other.source) {
            (
                PrototypeSource::Mesh { mesh: a, materials: ma },
                PrototypeSource::Mesh { mesh: b, materials: mb },
            ) => a.ptr_eq(b) && ma.len() == mb.len() && ma.iter().zip(mb).all(|(x, y)| x.ptr_eq(y)),
            (PrototypeSource::Prefab(a), PrototypeSource::Prefab(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    pub fn prefab(&self) -> Option<Arc<PrefabAsset>> {
        match &self.source {
            PrototypeSource::Prefab(p) => p.upgrade(),
            PrototypeSource::Mesh { .. } => None,
        }
    }

    pub fn mesh(&self) -> Option<Arc<MeshAsset>> {
        match &self.source {
            PrototypeSource::Mesh { mesh, .. } => mesh.upgrade(),
            PrototypeSource::Prefab(_) => None,
        }
    }

    /// Local bounds including prefab scale
    pub fn bounds(&self) -> Option<Aabb> {
        match &self.source {
            PrototypeSource::Mesh { mesh, .. } => mesh.upgrade().map(|m| m.bounds),
            PrototypeSource::Prefab(p) => p.upgrade().and_then(|p| p.bounds()),
        }
    }

    /// Root scale of the prefab; meshes have none
    pub fn prefab_scale(&self) -> Vec3 {
        self.prefab().map_or(Vec3::ONE, |p| p.scale)
    }
}
