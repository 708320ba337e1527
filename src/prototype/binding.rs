//! Prototype to render-source binding.

use super::Prototype;
use crate::backend::{RenderBackend, RenderKey};
use crate::core::{Error, Result};

/// Registration state of one prototype.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BindingState {
    #[default]
    Unbound,
    Bound(RenderKey),
}

impl BindingState {
    /// Render key, zero when unbound
    pub fn key(self) -> RenderKey {
        match self {
            BindingState::Unbound => RenderKey::NONE,
            BindingState::Bound(key) => key,
        }
    }

    pub fn is_bound(self) -> bool {
        matches!(self, BindingState::Bound(_))
    }
}

/// One binding per prototype, kept parallel to the registry.
#[derive(Debug, Default)]
pub struct RenderBindings {
    states: Vec<BindingState>,
}

impl RenderBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `prototype` with the backend, disposing any previous key
    /// first. No-op (returns the zero key) unless the prototype is enabled
    /// and valid.
    pub fn register(
        &mut self,
        backend: &mut dyn RenderBackend,
        index: usize,
        prototype: &Prototype,
    ) -> Result<RenderKey> {
        if index >= self.states.len() {
            return Err(Error::PrototypeIndex {
                index,
                count: self.states.len(),
            });
        }
        if !prototype.enabled || !prototype.is_valid() {
            return Ok(RenderKey::NONE);
        }
        self.dispose(backend, index);
        let key = backend.register_render_source(prototype)?;
        self.states[index] = BindingState::Bound(key);
        log::debug!("Registered prototype '{}' as {}", prototype.name(), key);
        Ok(key)
    }

    /// Register unless already bound.
    pub fn ensure_registered(
        &mut self,
        backend: &mut dyn RenderBackend,
        index: usize,
        prototype: &Prototype,
    ) -> Result<RenderKey> {
        match self.state(index) {
            BindingState::Bound(key) => Ok(key),
            BindingState::Unbound => self.register(backend, index, prototype),
        }
    }

    /// Dispose the binding at `index`, returning the key it held.
    pub fn dispose(&mut self, backend: &mut dyn RenderBackend, index: usize) -> RenderKey {
        let Some(state) = self.states.get_mut(index) else {
            return RenderKey::NONE;
        };
        let key = std::mem::take(state).key();
        if key.is_some() {
            backend.dispose_render_source(key);
        }
        key
    }

    pub fn dispose_all(&mut self, backend: &mut dyn RenderBackend) {
        for index in 0..self.states.len() {
            self.dispose(backend, index);
        }
    }

    pub fn state(&self, index: usize) -> BindingState {
        self.states.get(index).copied().unwrap_or_default()
    }

    pub fn key(&self, index: usize) -> RenderKey {
        self.state(index).key()
    }

    pub fn push(&mut self) {
        self.states.push(BindingState::Unbound);
    }

    /// Drop the slot at `index`; the binding must already be disposed.
    pub fn remove(&mut self, index: usize) -> Option<BindingState> {
        (index < self.states.len()).then(|| self.states.remove(index))
    }

    /// Grow or shrink to `len` slots. New slots are unbound.
    pub fn resize(&mut self, len: usize) {
        self.states.resize(len, BindingState::Unbound);
    }

    pub fn keys(&self) -> impl Iterator<Item = RenderKey> + '_ {
        self.states.iter().map(|s| s.key())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{MaterialAsset, MeshAsset, ShaderAsset};
    use crate::backend::HostBackend;
    use crate::config::RenderPipelineKind;
    use crate::prototype::{InstanceProfile, PrototypeDescriptor};
    use std::sync::Arc;

    fn prototype(mesh: &Arc<MeshAsset>, mat: &Arc<MaterialAsset>) -> Prototype {
        let mut p = Prototype::new(PrototypeDescriptor::from_mesh(mesh, &[mat.clone()]), InstanceProfile::default());
        p.validate(RenderPipelineKind::Builtin);
        p
    }

    #[test]
    fn test_register_dispose_cycle() {
        let mut backend = HostBackend::new();
        let mesh = Arc::new(MeshAsset::new("shrub"));
        let mat = Arc::new(MaterialAsset::new("leaf", Arc::new(ShaderAsset::new("Lit"))));
        let proto = prototype(&mesh, &mat);

        let mut bindings = RenderBindings::new();
        bindings.push();
        let key = bindings.register(&mut backend, 0, &proto).unwrap();
        assert!(key.is_some());
        assert_eq!(bindings.ensure_registered(&mut backend, 0, &proto).unwrap(), key);
        assert_eq!(backend.live_sources(), 1);

        // Re-registration replaces the key
        let again = bindings.register(&mut backend, 0, &proto).unwrap();
        assert_ne!(again, key);
        assert_eq!(backend.live_sources(), 1);

        assert_eq!(bindings.dispose(&mut backend, 0), again);
        assert_eq!(bindings.key(0), RenderKey::NONE);
        assert_eq!(bindings.dispose(&mut backend, 0), RenderKey::NONE);
        assert_eq!(backend.live_sources(), 0);
    }

    #[test]
    fn test_disabled_or_invalid_not_registered() {
        let mut backend = HostBackend::new();
        let mesh = Arc::new(MeshAsset::new("shrub"));
        let mat = Arc::new(MaterialAsset::new("leaf", Arc::new(ShaderAsset::new("Lit"))));
        let mut proto = prototype(&mesh, &mat);
        proto.enabled = false;

        let mut bindings = RenderBindings::new();
        bindings.resize(1);
        assert!(bindings.register(&mut backend, 0, &proto).unwrap().is_none());

        let bare = Arc::new(MeshAsset::new("bare"));
        let mut invalid = Prototype::new(PrototypeDescriptor::from_mesh(&bare, &[]), InstanceProfile::default());
        invalid.validate(RenderPipelineKind::Builtin);
        assert!(bindings.register(&mut backend, 0, &invalid).unwrap().is_none());
        assert_eq!(backend.live_sources(), 0);
        assert!(bindings.register(&mut backend, 3, &invalid).is_err());
    }
}
