//! Raw tree placement as authored on a terrain.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// One tree placement.
///
/// `position` holds terrain-local fractions in [0,1]; x runs along the
/// terrain's X axis, z along its Z axis. The y component is ignored, height
/// comes from the heightmap.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct TreeInstanceRecord {
    pub position: [f32; 3],
    /// Radians about Y
    pub rotation: f32,
    pub width_scale: f32,
    pub height_scale: f32,
    /// Index into the terrain's own tree prototype table
    pub prototype_index: u32,
}

impl TreeInstanceRecord {
    pub fn new(x: f32, z: f32, prototype_index: u32) -> Self {
        Self {
            position: [x, 0.0, z],
            rotation: 0.0,
            width_scale: 1.0,
            height_scale: 1.0,
            prototype_index,
        }
    }

    pub fn with_rotation(mut self, radians: f32) -> Self {
        self.rotation = radians;
        self
    }

    pub fn with_scale(mut self, width: f32, height: f32) -> Self {
        self.width_scale = width;
        self.height_scale = height;
        self
    }
}
