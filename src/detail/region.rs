//! World-space regions for density painting.

use glam::{Mat4, Quat, Vec3};

use crate::backend::kernel::{self, DensityPaintParams, PaintKernel};
use crate::math::Aabb;

/// Volume a density edit applies to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RegionShape {
    /// Axis-aligned world bounds
    Bounds(Aabb),
    OrientedBox {
        center: Vec3,
        half_extents: Vec3,
        rotation: Quat,
    },
    Sphere {
        center: Vec3,
        radius: f32,
    },
    Capsule {
        start: Vec3,
        end: Vec3,
        radius: f32,
    },
}

impl RegionShape {
    pub fn kernel(&self) -> PaintKernel {
        match self {
            RegionShape::Bounds(_) => PaintKernel::Bounds,
            RegionShape::OrientedBox { .. } => PaintKernel::OrientedBox,
            RegionShape::Sphere { .. } => PaintKernel::Sphere,
            RegionShape::Capsule { .. } => PaintKernel::Capsule,
        }
    }

    /// Axis-aligned world bounds of the shape
    pub fn world_bounds(&self) -> Aabb {
        match *self {
            RegionShape::Bounds(bounds) => bounds,
            RegionShape::OrientedBox {
                center,
                half_extents,
                rotation,
            } => Aabb::from_center_half_extent(Vec3::ZERO, half_extents)
                .transformed(&Mat4::from_rotation_translation(rotation, center)),
            RegionShape::Sphere { center, radius } => Aabb::from_center_half_extent(center, Vec3::splat(radius)),
            RegionShape::Capsule { start, end, radius } => {
                Aabb::new(start.min(end), start.max(end)).inflated(radius)
            }
        }
    }

    /// Fill the shape fields of the paint kernel parameters.
    pub fn write_params(&self, params: &mut DensityPaintParams) {
        match *self {
            RegionShape::Bounds(bounds) => {
                params.shape_a = bounds.min.extend(0.0).to_array();
                params.shape_b = bounds.max.extend(0.0).to_array();
            }
            RegionShape::OrientedBox {
                center,
                half_extents,
                rotation,
            } => {
                params.shape_a = center.extend(0.0).to_array();
                params.shape_b = half_extents.extend(0.0).to_array();
                params.shape_rotation = rotation.to_array();
            }
            RegionShape::Sphere { center, radius } => {
                params.shape_a = center.extend(radius).to_array();
            }
            RegionShape::Capsule { start, end, radius } => {
                params.shape_a = start.extend(radius).to_array();
                params.shape_b = end.extend(0.0).to_array();
            }
        }
    }

    /// Point test with the shape inflated by `offset`; same math as the kernels.
    pub fn contains(&self, point: Vec3, offset: f32) -> bool {
        let mut params = DensityPaintParams {
            offset,
            ..Default::default()
        };
        self.write_params(&mut params);
        kernel::paint_contains(self.kernel(), &params, point)
    }
}
