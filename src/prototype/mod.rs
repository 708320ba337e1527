//! Renderable prototypes.
//!
//! A prototype is one mesh+material set or prefab that many instances share.
//! The registry validates and indexes them; `RenderBindings` tracks which
//! ones are registered with the backend.

pub mod binding;
pub mod descriptor;
pub mod profile;
pub mod registry;
pub mod validation;

pub use binding::{BindingState, RenderBindings};
pub use descriptor::{PrototypeDescriptor, PrototypeSource};
pub use profile::InstanceProfile;
pub use registry::PrototypeRegistry;
pub use validation::{ErrorCategory, ErrorReason, ValidationError};

use glam::Vec3;

use crate::config::RenderPipelineKind;
use crate::math::Aabb;

/// A registered prototype and its last validation result.
#[derive(Clone, Debug)]
pub struct Prototype {
    descriptor: PrototypeDescriptor,
    pub enabled: bool,
    pub profile: InstanceProfile,
    /// Extra extent added to the asset bounds for culling
    pub bounds_offset: Option<Vec3>,
    error: Option<ValidationError>,
}

impl Prototype {
    pub fn new(descriptor: PrototypeDescriptor, profile: InstanceProfile) -> Self {
        Self {
            descriptor,
            enabled: true,
            profile,
            bounds_offset: None,
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn descriptor(&self) -> &PrototypeDescriptor {
        &self.descriptor
    }

    /// Last validation error
    pub fn error(&self) -> Option<ValidationError> {
        self.error
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none() && !self.descriptor.is_null()
    }

    /// Re-run validation and record the result.
    pub fn validate(&mut self, pipeline: RenderPipelineKind) -> Option<ValidationError> {
        self.error = validation::validate(&self.descriptor, pipeline).err();
        self.error
    }

    /// Culling bounds: asset bounds grown by the offset and profile padding
    pub fn bounds(&self) -> Option<Aabb> {
        let mut bounds = self.descriptor.bounds()?;
        if let Some(offset) = self.bounds_offset {
            bounds = Aabb::new(bounds.min - offset, bounds.max + offset);
        }
        Some(bounds.inflated(self.profile.bounds_padding))
    }
}
