//! Baked density textures: 8-bit grayscale PNGs, one per terrain layer.

use std::path::{Path, PathBuf};

use image::GrayImage;

use crate::backend::{RenderBackend, TextureId};
use crate::core::{Error, Result};

/// File name suffix of baked density textures
pub const BAKED_DENSITY_SUFFIX: &str = "_detail_density.png";

pub fn baked_file_name(terrain_name: &str, layer: usize) -> String {
    format!("{terrain_name}_{layer}{BAKED_DENSITY_SUFFIX}")
}

pub fn baked_path(dir: &Path, terrain_name: &str, layer: usize) -> PathBuf {
    dir.join(baked_file_name(terrain_name, layer))
}

/// Write a square density grid as a grayscale PNG.
pub fn write_density_png(path: &Path, resolution: u32, texels: Vec<u8>) -> Result<()> {
    let actual = texels.len();
    let image = GrayImage::from_raw(resolution, resolution, texels).ok_or(Error::TextureSize {
        expected: (resolution * resolution) as usize,
        actual,
    })?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image.save(path)?;
    Ok(())
}

/// Read a grayscale PNG back as (width, height, texels).
pub fn read_density_png(path: &Path) -> Result<(u32, u32, Vec<u8>)> {
    let image = image::open(path)?.to_luma8();
    let (w, h) = image.dimensions();
    Ok((w, h, image.into_raw()))
}

/// Save a density texture to `path`.
pub fn save_baked(backend: &mut dyn RenderBackend, texture: TextureId, path: &Path) -> Result<()> {
    let (w, h) = backend
        .texture_size(texture)
        .ok_or(Error::InvalidHandle { kind: "texture" })?;
    if w != h {
        return Err(Error::Terrain(format!("density texture is {w}x{h}, expected square")));
    }
    let texels = backend.read_texture(texture)?;
    write_density_png(path, w, texels)
}

/// Fill a density texture from `path`. Dimensions must match.
pub fn load_baked(backend: &mut dyn RenderBackend, texture: TextureId, path: &Path) -> Result<()> {
    let (w, h) = backend
        .texture_size(texture)
        .ok_or(Error::InvalidHandle { kind: "texture" })?;
    let (iw, ih, texels) = read_density_png(path)?;
    if (iw, ih) != (w, h) {
        return Err(Error::TextureSize {
            expected: (w * h) as usize,
            actual: (iw * ih) as usize,
        });
    }
    backend.write_texture(texture, &texels)
}
