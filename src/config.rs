//! Pipeline configuration.
//!
//! Everything has a sensible default; a JSON file only needs the fields it
//! wants to change.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::Result;

/// Render pipeline the host engine runs; decides shader compatibility.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RenderPipelineKind {
    #[default]
    Builtin,
    Universal,
    HighDefinition,
}

/// Transform buffer sizing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Smallest buffer handed to a bound prototype, in matrices.
    pub min_capacity: u32,
    /// Round growth up to the next power of two.
    pub grow_pow2: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            min_capacity: 1,
            grow_pow2: true,
        }
    }
}

/// Defaults for tree prototypes and the tree pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Apply each record's rotation about Y.
    pub apply_rotation: bool,
    /// Multiply record scale by the prefab's root scale.
    pub apply_prefab_scale: bool,
    /// Vertical offset added to every instance, meters.
    pub height_offset: f32,
    /// Zero out instances that fall on terrain holes.
    pub sample_holes: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            apply_rotation: true,
            apply_prefab_scale: true,
            height_offset: 0.0,
            sample_holes: true,
        }
    }
}

/// Detail density settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailConfig {
    /// Mask captured density with terrain holes.
    pub sample_holes: bool,
    /// Directory holding baked density PNGs.
    pub baked_dir: Option<PathBuf>,
}

impl Default for DetailConfig {
    fn default() -> Self {
        Self {
            sample_holes: true,
            baked_dir: None,
        }
    }
}

/// Top-level configuration shared by the managers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstancingConfig {
    pub render_pipeline: RenderPipelineKind,
    pub buffers: BufferConfig,
    pub tree: TreeConfig,
    pub detail: DetailConfig,
}

impl InstancingConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        log::info!("Loaded instancing config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = InstancingConfig::default();
        assert_eq!(cfg.render_pipeline, RenderPipelineKind::Builtin);
        assert_eq!(cfg.buffers.min_capacity, 1);
        assert!(cfg.tree.apply_rotation);
        assert!(cfg.detail.sample_holes);
    }

    #[test]
    fn test_partial_json() {
        let cfg = InstancingConfig::from_json(
            r#"{"render_pipeline":"Universal","tree":{"height_offset":-0.25}}"#,
        )
        .unwrap();
        assert_eq!(cfg.render_pipeline, RenderPipelineKind::Universal);
        assert_eq!(cfg.tree.height_offset, -0.25);
        assert!(cfg.tree.apply_prefab_scale);
        assert_eq!(cfg.buffers.min_capacity, 1);
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = InstancingConfig::from_json("{").unwrap_err();
        assert!(matches!(err, crate::core::Error::Config(_)));
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("instancing.json");
        let mut cfg = InstancingConfig::default();
        cfg.detail.baked_dir = Some(PathBuf::from("baked"));
        cfg.save(&path).unwrap();
        let loaded = InstancingConfig::load(&path).unwrap();
        assert_eq!(loaded.detail.baked_dir, Some(PathBuf::from("baked")));
    }
}
