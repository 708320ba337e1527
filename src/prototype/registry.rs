//! Ordered prototype storage with validation.

use super::{InstanceProfile, Prototype, PrototypeDescriptor, ValidationError};
use crate::config::RenderPipelineKind;
use crate::core::logging::LogOnce;
use crate::core::{Error, Result};

/// Prototypes in index order. Indices are dense; removal compacts.
pub struct PrototypeRegistry {
    prototypes: Vec<Prototype>,
    pipeline: RenderPipelineKind,
    reported: LogOnce<(String, u32)>,
}

impl PrototypeRegistry {
    pub fn new(pipeline: RenderPipelineKind) -> Self {
        Self {
            prototypes: Vec::new(),
            pipeline,
            reported: LogOnce::new(),
        }
    }

    pub fn pipeline(&self) -> RenderPipelineKind {
        self.pipeline
    }

    /// Validate and append. Duplicates and invalid descriptors are rejected.
    pub fn add(&mut self, descriptor: PrototypeDescriptor, profile: InstanceProfile) -> Result<usize> {
        if self.contains(&descriptor) {
            return Err(Error::DuplicatePrototype(descriptor.name().to_string()));
        }
        let mut prototype = Prototype::new(descriptor, profile);
        if let Some(err) = prototype.validate(self.pipeline) {
            log::warn!("Rejected prototype '{}': {}", prototype.name(), err);
            return Err(Error::Prototype(err));
        }
        self.prototypes.push(prototype);
        Ok(self.prototypes.len() - 1)
    }

    /// Remove and return the prototype at `index`; later indices shift down.
    pub fn remove_at(&mut self, index: usize) -> Result<Prototype> {
        self.check_index(index)?;
        let removed = self.prototypes.remove(index);
        let name = removed.name().to_string();
        self.reported.clear_where(|(n, _)| *n == name);
        Ok(removed)
    }

    pub fn check_index(&self, index: usize) -> Result<()> {
        if index < self.prototypes.len() {
            Ok(())
        } else {
            Err(Error::PrototypeIndex {
                index,
                count: self.prototypes.len(),
            })
        }
    }

    pub fn contains(&self, descriptor: &PrototypeDescriptor) -> bool {
        self.prototypes.iter().any(|p| p.descriptor().same_asset(descriptor))
    }

    /// First prototype whose backing asset is gone
    pub fn first_null(&self) -> Option<usize> {
        self.prototypes.iter().position(|p| p.descriptor().is_null())
    }

    /// Re-validate one prototype. Errors are logged once per (prototype, code).
    pub fn revalidate(&mut self, index: usize) -> Option<ValidationError> {
        let prototype = self.prototypes.get_mut(index)?;
        let name = prototype.name().to_string();
        match prototype.validate(self.pipeline) {
            Some(err) => {
                if self.reported.first((name.clone(), err.code())) {
                    log::warn!("Prototype '{name}' failed validation: {err}");
                }
                Some(err)
            }
            None => {
                self.reported.clear_where(|(n, _)| *n == name);
                None
            }
        }
    }

    pub fn get(&self, index: usize) -> Option<&Prototype> {
        self.prototypes.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Prototype> {
        self.prototypes.get_mut(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.prototypes.iter().position(|p| p.name() == name)
    }

    pub fn as_slice(&self) -> &[Prototype] {
        &self.prototypes
    }

    pub fn iter(&self) -> impl Iterator<Item = &Prototype> {
        self.prototypes.iter()
    }

    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{MaterialAsset, MeshAsset, ShaderAsset};
    use std::sync::Arc;

    fn assets(name: &str) -> (Arc<MeshAsset>, Arc<MaterialAsset>) {
        let shader = Arc::new(ShaderAsset::new("Lit"));
        (
            Arc::new(MeshAsset::new(name)),
            Arc::new(MaterialAsset::new(format!("{name}_mat"), shader)),
        )
    }

    #[test]
    fn test_add_and_duplicate() {
        let mut reg = PrototypeRegistry::new(RenderPipelineKind::Builtin);
        let (mesh, mat) = assets("bush");
        let desc = PrototypeDescriptor::from_mesh(&mesh, &[mat.clone()]);
        assert_eq!(reg.add(desc.clone(), InstanceProfile::default()).unwrap(), 0);
        assert!(matches!(
            reg.add(desc, InstanceProfile::default()),
            Err(Error::DuplicatePrototype(_))
        ));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.index_of("bush"), Some(0));
    }

    #[test]
    fn test_add_rejects_invalid() {
        let mut reg = PrototypeRegistry::new(RenderPipelineKind::Builtin);
        let mesh = Arc::new(MeshAsset::new("bare"));
        let err = reg
            .add(PrototypeDescriptor::from_mesh(&mesh, &[]), InstanceProfile::default())
            .unwrap_err();
        assert!(matches!(err, Error::Prototype(_)));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_remove_compacts() {
        let mut reg = PrototypeRegistry::new(RenderPipelineKind::Builtin);
        let all: Vec<_> = ["a", "b", "c"].iter().map(|n| assets(n)).collect();
        for (mesh, mat) in &all {
            reg.add(PrototypeDescriptor::from_mesh(mesh, &[mat.clone()]), InstanceProfile::default())
                .unwrap();
        }
        let removed = reg.remove_at(1).unwrap();
        assert_eq!(removed.name(), "b");
        assert_eq!(reg.get(1).unwrap().name(), "c");
        assert!(matches!(reg.remove_at(5), Err(Error::PrototypeIndex { index: 5, count: 2 })));
    }

    #[test]
    fn test_first_null_and_revalidate() {
        let mut reg = PrototypeRegistry::new(RenderPipelineKind::Builtin);
        let (m1, mat1) = assets("keep");
        let (m2, mat2) = assets("drop");
        reg.add(PrototypeDescriptor::from_mesh(&m1, &[mat1.clone()]), InstanceProfile::default())
            .unwrap();
        reg.add(PrototypeDescriptor::from_mesh(&m2, &[mat2.clone()]), InstanceProfile::default())
            .unwrap();
        assert_eq!(reg.first_null(), None);

        drop(m2);
        assert_eq!(reg.first_null(), Some(1));

        drop(mat1);
        assert!(reg.revalidate(0).is_some());
        assert!(!reg.get(0).unwrap().is_valid());
        // Logged once, stays invalid
        assert!(reg.revalidate(0).is_some());
    }
}
