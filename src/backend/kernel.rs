//! Compute kernel definitions.
//!
//! Each kernel family is a small enum of variants chosen at dispatch time
//! (holes on/off, terrain rotation on/off, paint shape). The parameter
//! structs are uploaded verbatim as uniforms and must match the WGSL
//! declarations in `shaders/`. The free functions at the bottom are the
//! per-thread bodies; `HostBackend` runs them directly and the WGSL
//! kernels mirror them line for line.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Quat, Vec3};

use super::handle::{BufferId, TextureId};
use crate::terrain::TreeInstanceRecord;

/// Workgroup edge for 2D texture kernels (8x8 threads).
pub const WORKGROUP_SIZE_2D: u32 = 8;

/// Workgroup width for 1D record kernels.
pub const WORKGROUP_SIZE_1D: u32 = 64;

/// Highest raw density a detail layer cell can hold.
pub const DETAIL_MAX_DENSITY: u32 = 16;

/// Holes mask values below this are holes.
pub const HOLE_THRESHOLD: f32 = 0.5;

/// Detail capture variants
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaptureKernel {
    Plain,
    SampleHoles,
}

impl CaptureKernel {
    pub fn select(sample_holes: bool) -> Self {
        if sample_holes { CaptureKernel::SampleHoles } else { CaptureKernel::Plain }
    }

    pub fn entry_point(self) -> &'static str {
        match self {
            CaptureKernel::Plain => "capture_plain",
            CaptureKernel::SampleHoles => "capture_holes",
        }
    }

    pub const ALL: [CaptureKernel; 2] = [CaptureKernel::Plain, CaptureKernel::SampleHoles];
}

/// Density paint variants, one per region shape
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaintKernel {
    Bounds,
    OrientedBox,
    Sphere,
    Capsule,
}

impl PaintKernel {
    pub fn entry_point(self) -> &'static str {
        match self {
            PaintKernel::Bounds => "paint_bounds",
            PaintKernel::OrientedBox => "paint_box",
            PaintKernel::Sphere => "paint_sphere",
            PaintKernel::Capsule => "paint_capsule",
        }
    }

    pub const ALL: [PaintKernel; 4] = [
        PaintKernel::Bounds,
        PaintKernel::OrientedBox,
        PaintKernel::Sphere,
        PaintKernel::Capsule,
    ];
}

/// Tree instance variants
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TreeKernel {
    Plain,
    Holes,
    RotationOffset,
    HolesRotationOffset,
}

impl TreeKernel {
    pub fn select(holes: bool, rotation_offset: bool) -> Self {
        match (holes, rotation_offset) {
            (false, false) => TreeKernel::Plain,
            (true, false) => TreeKernel::Holes,
            (false, true) => TreeKernel::RotationOffset,
            (true, true) => TreeKernel::HolesRotationOffset,
        }
    }

    pub fn samples_holes(self) -> bool {
        matches!(self, TreeKernel::Holes | TreeKernel::HolesRotationOffset)
    }

    pub fn applies_rotation_offset(self) -> bool {
        matches!(self, TreeKernel::RotationOffset | TreeKernel::HolesRotationOffset)
    }

    pub fn entry_point(self) -> &'static str {
        match self {
            TreeKernel::Plain => "tree_plain",
            TreeKernel::Holes => "tree_holes",
            TreeKernel::RotationOffset => "tree_rotated",
            TreeKernel::HolesRotationOffset => "tree_holes_rotated",
        }
    }

    pub const ALL: [TreeKernel; 4] = [
        TreeKernel::Plain,
        TreeKernel::Holes,
        TreeKernel::RotationOffset,
        TreeKernel::HolesRotationOffset,
    ];
}

/// Uniforms for the detail capture kernel (16 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct DetailCaptureParams {
    pub resolution: u32,
    pub holes_resolution: u32,
    pub _pad: [u32; 2],
}

/// Uniforms for the density paint kernels (112 bytes)
///
/// Shape encoding per variant:
/// - Bounds: `shape_a.xyz` = min, `shape_b.xyz` = max
/// - OrientedBox: `shape_a.xyz` = center, `shape_b.xyz` = half extents,
///   `shape_rotation` = box rotation
/// - Sphere: `shape_a.xyz` = center, `shape_a.w` = radius
/// - Capsule: `shape_a.xyz` = segment start, `shape_b.xyz` = segment end,
///   `shape_a.w` = radius
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DensityPaintParams {
    pub terrain_position: [f32; 3],
    pub detail_resolution: u32,
    pub terrain_size: [f32; 3],
    pub heightmap_resolution: u32,
    pub terrain_rotation: [f32; 4],
    pub shape_a: [f32; 4],
    pub shape_b: [f32; 4],
    pub shape_rotation: [f32; 4],
    pub offset: f32,
    /// Encoded 8-bit density written inside the shape
    pub value: u32,
    pub _pad: [u32; 2],
}

impl Default for DensityPaintParams {
    fn default() -> Self {
        Self {
            terrain_position: [0.0; 3],
            detail_resolution: 0,
            terrain_size: [0.0; 3],
            heightmap_resolution: 0,
            terrain_rotation: Quat::IDENTITY.to_array(),
            shape_a: [0.0; 4],
            shape_b: [0.0; 4],
            shape_rotation: Quat::IDENTITY.to_array(),
            offset: 0.0,
            value: 0,
            _pad: [0; 2],
        }
    }
}

/// Uniforms for the tree instance kernels (96 bytes)
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct TreeInstanceParams {
    pub terrain_position: [f32; 3],
    pub record_count: u32,
    pub terrain_size: [f32; 3],
    pub heightmap_resolution: u32,
    pub terrain_rotation: [f32; 4],
    pub prefab_scale: [f32; 3],
    /// Terrain-local prototype index this dispatch expands
    pub terrain_prototype_index: u32,
    pub start_index: u32,
    pub capacity: u32,
    pub apply_rotation: u32,
    pub apply_prefab_scale: u32,
    pub holes_resolution: u32,
    /// Slot in the counter buffer owned by the target prototype
    pub counter_slot: u32,
    pub height_offset: f32,
    pub _pad: u32,
}

impl Default for TreeInstanceParams {
    fn default() -> Self {
        Self {
            terrain_position: [0.0; 3],
            record_count: 0,
            terrain_size: [0.0; 3],
            heightmap_resolution: 0,
            terrain_rotation: Quat::IDENTITY.to_array(),
            prefab_scale: [1.0; 3],
            terrain_prototype_index: 0,
            start_index: 0,
            capacity: 0,
            apply_rotation: 1,
            apply_prefab_scale: 1,
            holes_resolution: 0,
            counter_slot: 0,
            height_offset: 0.0,
            _pad: 0,
        }
    }
}

/// One compute dispatch with its resources bound.
#[derive(Clone, Debug)]
pub enum Dispatch {
    /// Raw detail layer (one u32 per cell) into a density texture
    CaptureDetail {
        kernel: CaptureKernel,
        params: DetailCaptureParams,
        source: BufferId,
        holes: Option<TextureId>,
        target: TextureId,
    },
    /// Overwrite density texels whose world position lies inside a shape
    PaintDensity {
        kernel: PaintKernel,
        params: DensityPaintParams,
        heightmap: TextureId,
        target: TextureId,
    },
    /// Expand tree records of one terrain-prototype pair into matrices
    TreeInstances {
        kernel: TreeKernel,
        params: TreeInstanceParams,
        records: BufferId,
        heightmap: TextureId,
        holes: Option<TextureId>,
        counters: BufferId,
        output: BufferId,
    },
}

impl Dispatch {
    /// Workgroup counts covering the dispatch domain
    pub fn thread_groups(&self) -> [u32; 3] {
        match self {
            Dispatch::CaptureDetail { params, .. } => {
                let g = params.resolution.div_ceil(WORKGROUP_SIZE_2D);
                [g, g, 1]
            }
            Dispatch::PaintDensity { params, .. } => {
                let g = params.detail_resolution.div_ceil(WORKGROUP_SIZE_2D);
                [g, g, 1]
            }
            Dispatch::TreeInstances { params, .. } => {
                [params.record_count.div_ceil(WORKGROUP_SIZE_1D), 1, 1]
            }
        }
    }

    pub fn entry_point(&self) -> &'static str {
        match self {
            Dispatch::CaptureDetail { kernel, .. } => kernel.entry_point(),
            Dispatch::PaintDensity { kernel, .. } => kernel.entry_point(),
            Dispatch::TreeInstances { kernel, .. } => kernel.entry_point(),
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel bodies
// ---------------------------------------------------------------------------

/// Raw layer density [0,16] to 8-bit texel value, rounded.
pub fn encode_density(raw: u32) -> u8 {
    ((raw.min(DETAIL_MAX_DENSITY) * 255 + DETAIL_MAX_DENSITY / 2) / DETAIL_MAX_DENSITY) as u8
}

/// Bilinear heightmap sample; `u`,`v` in [0,1] span corner to corner.
pub fn sample_height(heights: &[f32], resolution: u32, u: f32, v: f32) -> f32 {
    if resolution == 0 || heights.is_empty() {
        return 0.0;
    }
    let max = (resolution - 1) as f32;
    let fx = (u.clamp(0.0, 1.0) * max).max(0.0);
    let fz = (v.clamp(0.0, 1.0) * max).max(0.0);
    let x0 = fx.floor() as u32;
    let z0 = fz.floor() as u32;
    let x1 = (x0 + 1).min(resolution - 1);
    let z1 = (z0 + 1).min(resolution - 1);
    let tx = fx - x0 as f32;
    let tz = fz - z0 as f32;

    let at = |x: u32, z: u32| heights.get((z * resolution + x) as usize).copied().unwrap_or(0.0);
    let h0 = at(x0, z0) + (at(x1, z0) - at(x0, z0)) * tx;
    let h1 = at(x0, z1) + (at(x1, z1) - at(x0, z1)) * tx;
    h0 + (h1 - h0) * tz
}

/// Nearest-texel holes lookup. Anything below `HOLE_THRESHOLD` is a hole.
pub fn is_hole(holes: &[f32], resolution: u32, u: f32, v: f32) -> bool {
    if resolution == 0 || holes.is_empty() {
        return false;
    }
    let x = ((u.clamp(0.0, 1.0) * resolution as f32) as u32).min(resolution - 1);
    let z = ((v.clamp(0.0, 1.0) * resolution as f32) as u32).min(resolution - 1);
    holes
        .get((z * resolution + x) as usize)
        .is_some_and(|&h| h < HOLE_THRESHOLD)
}

/// One texel of the capture kernel.
pub fn capture_texel(
    kernel: CaptureKernel,
    params: &DetailCaptureParams,
    raw: u32,
    holes: &[f32],
    x: u32,
    y: u32,
) -> u8 {
    if kernel == CaptureKernel::SampleHoles {
        let res = params.resolution as f32;
        let u = (x as f32 + 0.5) / res;
        let v = (y as f32 + 0.5) / res;
        if is_hole(holes, params.holes_resolution, u, v) {
            return 0;
        }
    }
    encode_density(raw)
}

/// World position of a density texel center, height taken from the heightmap.
pub fn texel_world_position(params: &DensityPaintParams, heights: &[f32], x: u32, y: u32) -> Vec3 {
    let res = params.detail_resolution.max(1) as f32;
    let u = (x as f32 + 0.5) / res;
    let v = (y as f32 + 0.5) / res;
    let size = Vec3::from_array(params.terrain_size);
    let h = sample_height(heights, params.heightmap_resolution, u, v);
    let local = Vec3::new(u * size.x, h * size.y, v * size.z);
    Vec3::from_array(params.terrain_position) + Quat::from_array(params.terrain_rotation) * local
}

/// Shape test of the paint kernels, shape inflated by `params.offset`.
pub fn paint_contains(kernel: PaintKernel, params: &DensityPaintParams, p: Vec3) -> bool {
    let a = Vec3::new(params.shape_a[0], params.shape_a[1], params.shape_a[2]);
    let b = Vec3::new(params.shape_b[0], params.shape_b[1], params.shape_b[2]);
    let offset = params.offset;
    match kernel {
        PaintKernel::Bounds => {
            let min = a - Vec3::splat(offset);
            let max = b + Vec3::splat(offset);
            p.cmpge(min).all() && p.cmple(max).all()
        }
        PaintKernel::OrientedBox => {
            let local = Quat::from_array(params.shape_rotation).inverse() * (p - a);
            local.abs().cmple(b + Vec3::splat(offset)).all()
        }
        PaintKernel::Sphere => p.distance(a) <= params.shape_a[3] + offset,
        PaintKernel::Capsule => {
            let seg = b - a;
            let len_sq = seg.length_squared();
            let t = if len_sq > 0.0 { ((p - a).dot(seg) / len_sq).clamp(0.0, 1.0) } else { 0.0 };
            p.distance(a + seg * t) <= params.shape_a[3] + offset
        }
    }
}

/// World matrix for one tree record, or None when the record belongs to
/// another prototype. Records over a hole produce a zero matrix.
pub fn tree_instance_matrix(
    kernel: TreeKernel,
    params: &TreeInstanceParams,
    record: &TreeInstanceRecord,
    heights: &[f32],
    holes: &[f32],
) -> Option<Mat4> {
    if record.prototype_index != params.terrain_prototype_index {
        return None;
    }
    let u = record.position[0];
    let v = record.position[2];
    if kernel.samples_holes() && is_hole(holes, params.holes_resolution, u, v) {
        return Some(Mat4::ZERO);
    }

    let size = Vec3::from_array(params.terrain_size);
    let h = sample_height(heights, params.heightmap_resolution, u, v);
    let local = Vec3::new(u * size.x, h * size.y + params.height_offset, v * size.z);

    let terrain_rotation = if kernel.applies_rotation_offset() {
        Quat::from_array(params.terrain_rotation)
    } else {
        Quat::IDENTITY
    };
    let position = Vec3::from_array(params.terrain_position) + terrain_rotation * local;

    let own_rotation = if params.apply_rotation != 0 {
        Quat::from_rotation_y(record.rotation)
    } else {
        Quat::IDENTITY
    };

    let mut scale = Vec3::new(record.width_scale, record.height_scale, record.width_scale);
    if params.apply_prefab_scale != 0 {
        scale *= Vec3::from_array(params.prefab_scale);
    }

    Some(Mat4::from_scale_rotation_translation(scale, terrain_rotation * own_rotation, position))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_params() -> TreeInstanceParams {
        TreeInstanceParams {
            terrain_position: [100.0, 5.0, 200.0],
            terrain_size: [1000.0, 600.0, 1000.0],
            heightmap_resolution: 2,
            record_count: 1,
            capacity: 1,
            ..Default::default()
        }
    }

    fn record(x: f32, z: f32, prototype_index: u32) -> TreeInstanceRecord {
        TreeInstanceRecord {
            position: [x, 0.0, z],
            rotation: 0.0,
            width_scale: 1.0,
            height_scale: 1.0,
            prototype_index,
        }
    }

    #[test]
    fn test_param_sizes_match_wgsl() {
        assert_eq!(std::mem::size_of::<DetailCaptureParams>(), 16);
        assert_eq!(std::mem::size_of::<DensityPaintParams>(), 112);
        assert_eq!(std::mem::size_of::<TreeInstanceParams>(), 96);
    }

    #[test]
    fn test_encode_density() {
        assert_eq!(encode_density(0), 0);
        assert_eq!(encode_density(16), 255);
        assert_eq!(encode_density(8), 128);
        assert_eq!(encode_density(40), 255, "values above 16 clamp");
    }

    #[test]
    fn test_sample_height_bilinear() {
        let heights = [0.0, 1.0, 0.0, 1.0];
        assert_eq!(sample_height(&heights, 2, 0.0, 0.0), 0.0);
        assert_eq!(sample_height(&heights, 2, 1.0, 0.0), 1.0);
        assert!((sample_height(&heights, 2, 0.5, 0.5) - 0.5).abs() < 1e-6);
        assert_eq!(sample_height(&[], 0, 0.5, 0.5), 0.0);
    }

    #[test]
    fn test_is_hole() {
        // 2x2 mask with a hole in the top-right cell
        let holes = [1.0, 0.0, 1.0, 1.0];
        assert!(is_hole(&holes, 2, 0.75, 0.25));
        assert!(!is_hole(&holes, 2, 0.25, 0.25));
        assert!(!is_hole(&[], 0, 0.75, 0.25), "no mask means no holes");
    }

    #[test]
    fn test_capture_texel_holes() {
        let params = DetailCaptureParams { resolution: 2, holes_resolution: 2, _pad: [0; 2] };
        let holes = [1.0, 0.0, 1.0, 1.0];
        assert_eq!(capture_texel(CaptureKernel::SampleHoles, &params, 16, &holes, 1, 0), 0);
        assert_eq!(capture_texel(CaptureKernel::Plain, &params, 16, &holes, 1, 0), 255);
        assert_eq!(capture_texel(CaptureKernel::SampleHoles, &params, 16, &holes, 0, 0), 255);
    }

    #[test]
    fn test_paint_shapes() {
        let mut params = DensityPaintParams { offset: 0.0, ..Default::default() };

        params.shape_a = [0.0, 0.0, 0.0, 0.0];
        params.shape_b = [1.0, 1.0, 1.0, 0.0];
        assert!(paint_contains(PaintKernel::Bounds, &params, Vec3::splat(0.5)));
        assert!(!paint_contains(PaintKernel::Bounds, &params, Vec3::splat(1.2)));
        params.offset = 0.5;
        assert!(paint_contains(PaintKernel::Bounds, &params, Vec3::splat(1.2)));

        params.offset = 0.0;
        params.shape_a = [0.0, 0.0, 0.0, 2.0];
        assert!(paint_contains(PaintKernel::Sphere, &params, Vec3::new(1.9, 0.0, 0.0)));
        assert!(!paint_contains(PaintKernel::Sphere, &params, Vec3::new(2.1, 0.0, 0.0)));

        params.shape_a = [0.0, 0.0, 0.0, 1.0];
        params.shape_b = [10.0, 0.0, 0.0, 0.0];
        assert!(paint_contains(PaintKernel::Capsule, &params, Vec3::new(5.0, 0.9, 0.0)));
        assert!(paint_contains(PaintKernel::Capsule, &params, Vec3::new(10.9, 0.0, 0.0)));
        assert!(!paint_contains(PaintKernel::Capsule, &params, Vec3::new(5.0, 1.1, 0.0)));
    }

    #[test]
    fn test_paint_oriented_box() {
        let params = DensityPaintParams {
            shape_a: [0.0, 0.0, 0.0, 0.0],
            shape_b: [4.0, 1.0, 1.0, 0.0],
            shape_rotation: Quat::from_rotation_y(std::f32::consts::FRAC_PI_2).to_array(),
            ..Default::default()
        };
        // Long axis rotated from X onto Z
        assert!(paint_contains(PaintKernel::OrientedBox, &params, Vec3::new(0.0, 0.0, 3.5)));
        assert!(!paint_contains(PaintKernel::OrientedBox, &params, Vec3::new(3.5, 0.0, 0.0)));
    }

    #[test]
    fn test_texel_world_position() {
        let params = DensityPaintParams {
            terrain_position: [10.0, 2.0, 20.0],
            terrain_size: [4.0, 10.0, 4.0],
            detail_resolution: 4,
            heightmap_resolution: 2,
            ..Default::default()
        };
        let heights = [0.5; 4];
        let p = texel_world_position(&params, &heights, 0, 3);
        assert!((p - Vec3::new(10.5, 7.0, 23.5)).length() < 1e-5);
    }

    #[test]
    fn test_tree_matrix_position_and_filter() {
        let params = flat_params();
        let heights = [0.5; 4];
        let m = tree_instance_matrix(TreeKernel::Plain, &params, &record(0.5, 0.25, 0), &heights, &[]).unwrap();
        let translation = m.w_axis.truncate();
        assert!((translation - Vec3::new(600.0, 305.0, 450.0)).length() < 1e-3);

        assert!(tree_instance_matrix(TreeKernel::Plain, &params, &record(0.5, 0.5, 3), &heights, &[]).is_none());
    }

    #[test]
    fn test_tree_matrix_rotation_and_scale_flags() {
        let mut params = flat_params();
        params.prefab_scale = [2.0, 2.0, 2.0];
        let mut rec = record(0.0, 0.0, 0);
        rec.rotation = std::f32::consts::FRAC_PI_2;
        rec.height_scale = 3.0;

        let m = tree_instance_matrix(TreeKernel::Plain, &params, &rec, &[0.0; 4], &[]).unwrap();
        let (scale, rotation, _) = m.to_scale_rotation_translation();
        assert!((scale - Vec3::new(2.0, 6.0, 2.0)).length() < 1e-4);
        assert!(rotation.angle_between(Quat::from_rotation_y(std::f32::consts::FRAC_PI_2)) < 1e-3);

        params.apply_rotation = 0;
        params.apply_prefab_scale = 0;
        let m = tree_instance_matrix(TreeKernel::Plain, &params, &rec, &[0.0; 4], &[]).unwrap();
        let (scale, rotation, _) = m.to_scale_rotation_translation();
        assert!((scale - Vec3::new(1.0, 3.0, 1.0)).length() < 1e-4);
        assert!(rotation.angle_between(Quat::IDENTITY) < 1e-3);
    }

    #[test]
    fn test_tree_matrix_terrain_rotation_offset() {
        let mut params = flat_params();
        params.terrain_position = [0.0; 3];
        params.terrain_size = [10.0, 0.0, 10.0];
        params.terrain_rotation = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2).to_array();
        let rec = record(1.0, 0.0, 0);

        let plain = tree_instance_matrix(TreeKernel::Plain, &params, &rec, &[0.0; 4], &[]).unwrap();
        assert!((plain.w_axis.truncate() - Vec3::new(10.0, 0.0, 0.0)).length() < 1e-4);

        let rotated = tree_instance_matrix(TreeKernel::RotationOffset, &params, &rec, &[0.0; 4], &[]).unwrap();
        assert!((rotated.w_axis.truncate() - Vec3::new(0.0, 0.0, -10.0)).length() < 1e-4);
    }

    #[test]
    fn test_tree_matrix_hole_is_zero() {
        let mut params = flat_params();
        params.holes_resolution = 2;
        let holes = [0.0, 1.0, 1.0, 1.0];
        let m = tree_instance_matrix(TreeKernel::Holes, &params, &record(0.1, 0.1, 0), &[0.0; 4], &holes).unwrap();
        assert_eq!(m, Mat4::ZERO);
        let m = tree_instance_matrix(TreeKernel::Plain, &params, &record(0.1, 0.1, 0), &[0.0; 4], &holes).unwrap();
        assert_ne!(m, Mat4::ZERO);
    }

    #[test]
    fn test_thread_groups() {
        let d = Dispatch::TreeInstances {
            kernel: TreeKernel::Plain,
            params: TreeInstanceParams { record_count: 65, ..Default::default() },
            records: BufferId(dummy_handle()),
            heightmap: TextureId(dummy_handle()),
            holes: None,
            counters: BufferId(dummy_handle()),
            output: BufferId(dummy_handle()),
        };
        assert_eq!(d.thread_groups(), [2, 1, 1]);
        assert_eq!(d.entry_point(), "tree_plain");
    }

    fn dummy_handle() -> super::super::handle::Handle {
        let mut table = super::super::handle::HandleTable::new();
        table.insert(())
    }
}
