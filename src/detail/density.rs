//! Detail density textures.
//!
//! Each detail layer of a terrain becomes one 8-bit texture at the layer's
//! resolution. Raw cell values (0..=16) are captured on the device; runtime
//! edits overwrite texels whose world position falls inside a region.
//! Texel (x, y) covers cell `y * resolution + x`, y running along terrain Z.
//!
//! The texture set of a terrain is owned by the caller (one per detail
//! manager), so several managers can build and edit their own sets for the
//! same terrain.

use std::path::{Path, PathBuf};

use super::bake::{self, baked_path};
use super::region::RegionShape;
use crate::backend::kernel::encode_density;
use crate::backend::{
    BufferUsage, CaptureKernel, DensityPaintParams, DetailCaptureParams, Dispatch, RenderBackend, TextureFormat,
    TextureId,
};
use crate::config::DetailConfig;
use crate::core::logging::LogOnce;
use crate::core::Result;
use crate::terrain::Terrain;

/// Builds, edits and persists density textures.
pub struct DetailDensityPipeline {
    sample_holes: bool,
    baked_dir: Option<PathBuf>,
    missing_bake: LogOnce<(String, usize)>,
    missing_heightmap: LogOnce<String>,
}

impl DetailDensityPipeline {
    pub fn new(config: &DetailConfig) -> Self {
        Self {
            sample_holes: config.sample_holes,
            baked_dir: config.baked_dir.clone(),
            missing_bake: LogOnce::new(),
            missing_heightmap: LogOnce::new(),
        }
    }

    pub fn baked_dir(&self) -> Option<&Path> {
        self.baked_dir.as_deref()
    }

    /// Allocate a zeroed density texture for one layer.
    pub fn create_detail_texture(&self, backend: &mut dyn RenderBackend, terrain: &Terrain, layer: usize) -> TextureId {
        let res = terrain.data().detail_resolution();
        let label = format!("{} detail {layer}", terrain.name());
        backend.create_texture(&label, TextureFormat::Density8, res, res)
    }

    /// Encode raw cells into `target`. Cells over holes become zero when a
    /// holes texture is given.
    pub fn capture_layer_to_texture(
        &self,
        backend: &mut dyn RenderBackend,
        raw: &[u32],
        resolution: u32,
        target: TextureId,
        holes: Option<(TextureId, u32)>,
    ) -> Result<()> {
        if resolution == 0 || raw.is_empty() {
            return Ok(());
        }
        let bytes: &[u8] = bytemuck::cast_slice(raw);
        let source = backend.create_buffer("detail cells", BufferUsage::Records, bytes.len() as u64);
        backend.write_buffer(source, 0, bytes)?;

        let dispatch = Dispatch::CaptureDetail {
            kernel: CaptureKernel::select(holes.is_some()),
            params: DetailCaptureParams {
                resolution,
                holes_resolution: holes.map_or(0, |(_, r)| r),
                _pad: [0; 2],
            },
            source,
            holes: holes.map(|(t, _)| t),
            target,
        };
        let result = backend.dispatch(&dispatch);
        backend.release_buffer(source);
        result
    }

    /// Make sure `textures` holds one texture per detail layer of `terrain`.
    /// Textures are rebuilt only when the layer count changed. Returns the
    /// layer count.
    pub fn sync_terrain(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrain: &mut Terrain,
        textures: &mut Vec<TextureId>,
    ) -> Result<usize> {
        let layers = terrain.data().detail_layer_count();
        let res = terrain.data().detail_resolution();
        if res == 0 || layers == 0 {
            self.release_textures(backend, textures);
            return Ok(0);
        }
        if textures.len() == layers {
            return Ok(layers);
        }
        self.release_textures(backend, textures);

        let holes = if self.sample_holes {
            terrain
                .holes_texture(backend)?
                .map(|t| (t, terrain.holes_resolution()))
        } else {
            None
        };

        let mut built = Vec::with_capacity(layers);
        for layer in 0..layers {
            let texture = self.create_detail_texture(backend, terrain, layer);
            built.push(texture);
            if let Err(e) = self.fill_layer(backend, terrain, layer, texture, holes) {
                self.release_textures(backend, &mut built);
                return Err(e);
            }
        }
        *textures = built;
        log::info!("Built {layers} density textures for terrain '{}' ({res}x{res})", terrain.name());
        Ok(layers)
    }

    fn fill_layer(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrain: &Terrain,
        layer: usize,
        texture: TextureId,
        holes: Option<(TextureId, u32)>,
    ) -> Result<()> {
        if terrain.detail_baked {
            if let Some(dir) = &self.baked_dir {
                let path = baked_path(dir, terrain.name(), layer);
                if path.exists() {
                    return bake::load_baked(backend, texture, &path);
                }
                if self.missing_bake.first((terrain.name().to_string(), layer)) {
                    log::warn!("Baked density {} missing, capturing instead", path.display());
                }
            }
        }
        let Some(raw) = terrain.data().detail_layer(layer) else {
            return Ok(());
        };
        self.capture_layer_to_texture(backend, raw, terrain.data().detail_resolution(), texture, holes)
    }

    /// Release and rebuild every density texture of `terrain`.
    pub fn reload_terrain(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrain: &mut Terrain,
        textures: &mut Vec<TextureId>,
    ) -> Result<usize> {
        self.release_textures(backend, textures);
        self.sync_terrain(backend, terrain, textures)
    }

    pub fn release_textures(&self, backend: &mut dyn RenderBackend, textures: &mut Vec<TextureId>) {
        for texture in textures.drain(..) {
            backend.release_texture(texture);
        }
    }

    /// Overwrite density inside `shape` (inflated by `offset`) on the given
    /// layers. `value` is raw density, 0..=16. Returns the dispatch count;
    /// zero when the terrain lies outside the shape.
    pub fn set_detail_density_in_region(
        &mut self,
        backend: &mut dyn RenderBackend,
        terrain: &mut Terrain,
        textures: &[TextureId],
        shape: &RegionShape,
        value: u32,
        offset: f32,
        layers: &[usize],
    ) -> Result<usize> {
        if layers.is_empty() || textures.is_empty() {
            return Ok(0);
        }
        if !terrain.world_bounds().intersects(&shape.world_bounds().inflated(offset)) {
            return Ok(0);
        }
        let Some(heightmap) = terrain.heightmap_texture(backend)? else {
            if self.missing_heightmap.first(terrain.name().to_string()) {
                log::warn!("Terrain '{}' has no heightmap, density edits skipped", terrain.name());
            }
            return Ok(0);
        };

        let mut params = DensityPaintParams {
            terrain_position: terrain.position.to_array(),
            detail_resolution: terrain.data().detail_resolution(),
            terrain_size: terrain.size().to_array(),
            heightmap_resolution: terrain.heightmap_resolution(),
            terrain_rotation: terrain.rotation.to_array(),
            offset,
            value: encode_density(value) as u32,
            ..Default::default()
        };
        shape.write_params(&mut params);

        let mut dispatches = 0;
        for &layer in layers {
            let Some(&target) = textures.get(layer) else {
                continue;
            };
            backend.dispatch(&Dispatch::PaintDensity {
                kernel: shape.kernel(),
                params,
                heightmap,
                target,
            })?;
            dispatches += 1;
        }
        Ok(dispatches)
    }

    /// Blocking read of one layer's texels.
    pub fn read_density(&self, backend: &mut dyn RenderBackend, textures: &[TextureId], layer: usize) -> Result<Option<Vec<u8>>> {
        match textures.get(layer) {
            Some(&texture) => Ok(Some(backend.read_texture(texture)?)),
            None => Ok(None),
        }
    }

    /// Write every layer of `terrain` to `dir`. Returns the written paths.
    pub fn save_baked_terrain(
        &self,
        backend: &mut dyn RenderBackend,
        terrain: &Terrain,
        textures: &[TextureId],
        dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for (layer, &texture) in textures.iter().enumerate() {
            let path = baked_path(dir, terrain.name(), layer);
            bake::save_baked(backend, texture, &path)?;
            written.push(path);
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::math::Aabb;
    use crate::terrain::{Heightmap, HolesMask, TerrainAsset};
    use glam::Vec3;
    use tempfile::TempDir;

    fn layered(resolution: u32, layers: Vec<Vec<u32>>) -> TerrainAsset {
        let mut asset = TerrainAsset::new("field", Vec3::new(4.0, 1.0, 4.0)).with_heightmap(Heightmap::flat(2, 0.0));
        asset.detail_resolution = resolution;
        for (i, cells) in layers.into_iter().enumerate() {
            asset.add_detail_layer(format!("grass{i}"), cells).unwrap();
        }
        asset
    }

    #[test]
    fn test_capture_diagonal() {
        let mut cells = vec![0u32; 16];
        cells[0] = 16;
        cells[5] = 16;
        let mut backend = HostBackend::new();
        let mut pipeline = DetailDensityPipeline::new(&DetailConfig::default());
        let mut terrain = Terrain::new(layered(4, vec![cells]));
        let mut textures = Vec::new();

        assert_eq!(pipeline.sync_terrain(&mut backend, &mut terrain, &mut textures).unwrap(), 1);
        let texels = pipeline.read_density(&mut backend, &textures, 0).unwrap().unwrap();
        let mut expected = vec![0u8; 16];
        expected[0] = 255;
        expected[5] = 255;
        assert_eq!(texels, expected);
    }

    #[test]
    fn test_capture_masks_holes() {
        let mut backend = HostBackend::new();
        let mut pipeline = DetailDensityPipeline::new(&DetailConfig::default());
        let mut holes = HolesMask::solid(2);
        holes.set_hole(1, 1);
        let mut terrain = Terrain::new(layered(2, vec![vec![16; 4]]).with_holes(holes));
        let mut textures = Vec::new();
        pipeline.sync_terrain(&mut backend, &mut terrain, &mut textures).unwrap();
        let texels = pipeline.read_density(&mut backend, &textures, 0).unwrap().unwrap();
        assert_eq!(texels, vec![255, 255, 255, 0]);
    }

    #[test]
    fn test_no_layers_is_empty_set() {
        let mut backend = HostBackend::new();
        let mut pipeline = DetailDensityPipeline::new(&DetailConfig::default());
        let mut terrain = Terrain::new(layered(0, Vec::new()));
        let mut textures = Vec::new();
        assert_eq!(pipeline.sync_terrain(&mut backend, &mut terrain, &mut textures).unwrap(), 0);
        assert!(textures.is_empty());
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn test_sync_is_stable_and_reload_rebuilds() {
        let mut backend = HostBackend::new();
        let mut pipeline = DetailDensityPipeline::new(&DetailConfig::default());
        let mut terrain = Terrain::new(layered(2, vec![vec![1; 4], vec![2; 4]]));
        let mut textures = Vec::new();
        pipeline.sync_terrain(&mut backend, &mut terrain, &mut textures).unwrap();
        let first = textures.clone();
        pipeline.sync_terrain(&mut backend, &mut terrain, &mut textures).unwrap();
        assert_eq!(textures, first);

        pipeline.reload_terrain(&mut backend, &mut terrain, &mut textures).unwrap();
        assert_ne!(textures, first);
        assert_eq!(backend.live_textures(), 2);
    }

    #[test]
    fn test_paint_idempotent_and_skips_far_terrain() {
        let mut backend = HostBackend::new();
        let mut pipeline = DetailDensityPipeline::new(&DetailConfig::default());
        let mut terrain = Terrain::new(layered(4, vec![vec![16; 16]]));
        let mut textures = Vec::new();
        pipeline.sync_terrain(&mut backend, &mut terrain, &mut textures).unwrap();

        let shape = RegionShape::Bounds(Aabb::new(Vec3::new(0.0, -1.0, 0.0), Vec3::new(2.0, 1.0, 2.0)));
        let n = pipeline
            .set_detail_density_in_region(&mut backend, &mut terrain, &textures, &shape, 0, 0.0, &[0])
            .unwrap();
        assert_eq!(n, 1);
        let once = pipeline.read_density(&mut backend, &textures, 0).unwrap().unwrap();
        assert_eq!(once.iter().filter(|&&t| t == 0).count(), 4);

        pipeline
            .set_detail_density_in_region(&mut backend, &mut terrain, &textures, &shape, 0, 0.0, &[0])
            .unwrap();
        let twice = pipeline.read_density(&mut backend, &textures, 0).unwrap().unwrap();
        assert_eq!(once, twice);

        let far = RegionShape::Sphere { center: Vec3::splat(500.0), radius: 1.0 };
        let dispatches = backend.stats().dispatches;
        let n = pipeline
            .set_detail_density_in_region(&mut backend, &mut terrain, &textures, &far, 16, 0.0, &[0])
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(backend.stats().dispatches, dispatches);
    }

    #[test]
    fn test_baked_files_used_when_present() {
        let dir = TempDir::new().unwrap();
        let config = DetailConfig {
            sample_holes: true,
            baked_dir: Some(dir.path().to_path_buf()),
        };
        let mut backend = HostBackend::new();
        let mut pipeline = DetailDensityPipeline::new(&config);

        let mut terrain = Terrain::new(layered(2, vec![vec![16, 0, 0, 16]]));
        let mut textures = Vec::new();
        pipeline.sync_terrain(&mut backend, &mut terrain, &mut textures).unwrap();
        let shape = RegionShape::Sphere { center: Vec3::new(3.0, 0.0, 1.0), radius: 0.5 };
        pipeline
            .set_detail_density_in_region(&mut backend, &mut terrain, &textures, &shape, 8, 0.0, &[0])
            .unwrap();
        let painted = pipeline.read_density(&mut backend, &textures, 0).unwrap().unwrap();
        assert_eq!(painted, vec![255, 128, 0, 255]);
        let paths = pipeline.save_baked_terrain(&mut backend, &terrain, &textures, dir.path()).unwrap();
        assert_eq!(paths.len(), 1);

        // A baked terrain loads the painted state instead of the raw cells
        terrain.detail_baked = true;
        pipeline.reload_terrain(&mut backend, &mut terrain, &mut textures).unwrap();
        assert_eq!(pipeline.read_density(&mut backend, &textures, 0).unwrap().unwrap(), painted);
    }
}
