//! Per-prototype culling and LOD settings passed to the draw path.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceProfile {
    pub frustum_culling: bool,
    pub occlusion_culling: bool,
    /// Instances closer than this are culled, meters.
    pub min_distance: f32,
    /// Instances farther than this are culled, meters.
    pub max_distance: f32,
    /// Multiplier on LOD switch distances.
    pub lod_bias: f32,
    pub cast_shadows: bool,
    pub shadow_distance: f32,
    /// Extra padding on culling bounds, meters.
    pub bounds_padding: f32,
}

impl Default for InstanceProfile {
    fn default() -> Self {
        Self {
            frustum_culling: true,
            occlusion_culling: true,
            min_distance: 0.0,
            max_distance: 500.0,
            lod_bias: 1.0,
            cast_shadows: true,
            shadow_distance: 150.0,
            bounds_padding: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_partial_json() {
        let p: InstanceProfile = serde_json::from_str(r#"{"max_distance": 80.0, "cast_shadows": false}"#).unwrap();
        assert_eq!(p.max_distance, 80.0);
        assert!(!p.cast_shadows);
        assert!(p.frustum_culling);
        assert!(p.max_distance > p.min_distance);
    }
}
