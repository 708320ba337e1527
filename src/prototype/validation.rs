//! Structural prototype validation.
//!
//! Failures are non-fatal: a prototype that fails stays in the registry
//! with its error recorded and is simply never bound.

use std::fmt;
use std::sync::Arc;

use super::descriptor::{PrototypeDescriptor, PrototypeSource};
use crate::assets::{MaterialAsset, RendererAsset};
use crate::config::RenderPipelineKind;

/// What part of the prototype failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Prefab = 1,
    Mesh = 2,
    Material = 3,
    Shader = 4,
    LodGroup = 5,
}

/// Why it failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorReason {
    Missing = 1,
    Empty = 2,
    Nested = 3,
    PipelineMismatch = 4,
    ConversionFailed = 5,
}

/// Category × reason. `code()` packs both as `category * 100 + reason`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub reason: ErrorReason,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, reason: ErrorReason) -> Self {
        Self { category, reason }
    }

    pub fn code(&self) -> u32 {
        self.category as u32 * 100 + self.reason as u32
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.category {
            ErrorCategory::Prefab => "prefab",
            ErrorCategory::Mesh => "mesh",
            ErrorCategory::Material => "material",
            ErrorCategory::Shader => "shader",
            ErrorCategory::LodGroup => "LOD group",
        };
        let why = match self.reason {
            ErrorReason::Missing => "missing",
            ErrorReason::Empty => "empty",
            ErrorReason::Nested => "nested",
            ErrorReason::PipelineMismatch => "incompatible with the active render pipeline",
            ErrorReason::ConversionFailed => "has no instanced variant",
        };
        write!(f, "{what} {why} (code {})", self.code())
    }
}

impl std::error::Error for ValidationError {}

fn fail(category: ErrorCategory, reason: ErrorReason) -> Result<(), ValidationError> {
    Err(ValidationError::new(category, reason))
}

fn check_material(material: Option<&Arc<MaterialAsset>>, pipeline: RenderPipelineKind) -> Result<(), ValidationError> {
    let Some(material) = material else {
        return fail(ErrorCategory::Material, ErrorReason::Missing);
    };
    let Some(shader) = &material.shader else {
        return fail(ErrorCategory::Shader, ErrorReason::Missing);
    };
    if !shader.supports(pipeline) {
        return fail(ErrorCategory::Shader, ErrorReason::PipelineMismatch);
    }
    if !shader.is_convertible() {
        return fail(ErrorCategory::Shader, ErrorReason::ConversionFailed);
    }
    Ok(())
}

fn check_renderer(renderer: &RendererAsset, pipeline: RenderPipelineKind) -> Result<(), ValidationError> {
    if renderer.mesh.is_none() {
        return fail(ErrorCategory::Mesh, ErrorReason::Missing);
    }
    if renderer.materials.is_empty() {
        return fail(ErrorCategory::Material, ErrorReason::Missing);
    }
    renderer
        .materials
        .iter()
        .try_for_each(|m| check_material(m.as_ref(), pipeline))
}

/// First structural problem of a descriptor under `pipeline`, if any.
pub fn validate(descriptor: &PrototypeDescriptor, pipeline: RenderPipelineKind) -> Result<(), ValidationError> {
    match descriptor.source() {
        PrototypeSource::Mesh { mesh, materials } => {
            if mesh.strong_count() == 0 {
                return fail(ErrorCategory::Mesh, ErrorReason::Missing);
            }
            if materials.is_empty() {
                return fail(ErrorCategory::Material, ErrorReason::Missing);
            }
            materials
                .iter()
                .try_for_each(|m| check_material(m.upgrade().as_ref(), pipeline))
        }
        PrototypeSource::Prefab(prefab) => {
            let Some(prefab) = prefab.upgrade() else {
                return fail(ErrorCategory::Prefab, ErrorReason::Missing);
            };
            if prefab.renderers.is_empty() {
                return fail(ErrorCategory::Prefab, ErrorReason::Empty);
            }
            if prefab.lod_groups.len() > 1 {
                return fail(ErrorCategory::LodGroup, ErrorReason::Nested);
            }
            if let Some(group) = prefab.lod_groups.first() {
                let out_of_range = group
                    .levels
                    .iter()
                    .flatten()
                    .any(|&r| r >= prefab.renderers.len());
                if group.levels.is_empty() || out_of_range {
                    return fail(ErrorCategory::LodGroup, ErrorReason::Empty);
                }
            }
            prefab
                .renderers
                .iter()
                .try_for_each(|r| check_renderer(r, pipeline))
        }
    }
}
