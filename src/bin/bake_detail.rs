//! Bake the detail density textures of a terrain to PNG files.
//!
//! Usage: cargo run --release --bin bake_detail -- --terrain assets/meadow.json --out assets/baked

use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use thicket::backend::{HostBackend, RenderBackend, TextureFormat};
use thicket::config::DetailConfig;
use thicket::core::logging;
use thicket::detail::{DetailDensityPipeline, baked_path, save_baked};
use thicket::terrain::TerrainAsset;

fn arg_value<'a>(args: &'a [String], name: &str) -> Option<&'a String> {
    args.iter().position(|a| a == name).and_then(|i| args.get(i + 1))
}

/// Capture one layer on a private host backend and write it out.
fn bake_layer(asset: &TerrainAsset, layer: usize, sample_holes: bool, out: &Path) -> thicket::Result<PathBuf> {
    let mut backend = HostBackend::new();
    let pipeline = DetailDensityPipeline::new(&DetailConfig {
        sample_holes,
        baked_dir: None,
    });
    let res = asset.detail_resolution;
    let target = backend.create_texture(&format!("{} detail {layer}", asset.name), TextureFormat::Density8, res, res);

    let holes = match (&asset.holes, sample_holes) {
        (Some(mask), true) => {
            let tex = backend.create_texture("holes", TextureFormat::Height32F, mask.resolution, mask.resolution);
            backend.write_texture(tex, &mask.to_texels())?;
            Some((tex, mask.resolution))
        }
        _ => None,
    };
    pipeline.capture_layer_to_texture(&mut backend, &asset.detail_layers[layer], res, target, holes)?;

    let path = baked_path(out, &asset.name, layer);
    save_baked(&mut backend, target, &path)?;
    Ok(path)
}

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().collect();
    let terrain_path = arg_value(&args, "--terrain").expect("Usage: bake_detail --terrain <file.json> --out <dir>");
    let out_dir = PathBuf::from(arg_value(&args, "--out").expect("Usage: bake_detail --terrain <file.json> --out <dir>"));
    let sample_holes = !args.iter().any(|a| a == "--no-holes");

    let asset = TerrainAsset::load(Path::new(terrain_path)).expect("Failed to load terrain");
    let layers = asset.detail_layers.len();
    println!("=== Baking detail density for '{}' ===", asset.name);
    println!("Layers: {}, resolution: {}", layers, asset.detail_resolution);

    if layers == 0 || asset.detail_resolution == 0 {
        println!("Nothing to bake");
        return;
    }
    std::fs::create_dir_all(&out_dir).expect("Failed to create output directory");

    let start = Instant::now();
    let written = AtomicUsize::new(0);
    (0..layers).into_par_iter().for_each(|layer| match bake_layer(&asset, layer, sample_holes, &out_dir) {
        Ok(path) => {
            written.fetch_add(1, Ordering::Relaxed);
            log::info!("Wrote {}", path.display());
        }
        Err(e) => log::error!("Layer {layer} ({}) failed: {e}", asset.detail_prototypes[layer]),
    });

    let count = written.load(Ordering::Relaxed);
    println!("\nDone! {}/{} layers baked in {:.1}s", count, layers, start.elapsed().as_secs_f64());
    if count != layers {
        std::process::exit(1);
    }
}
