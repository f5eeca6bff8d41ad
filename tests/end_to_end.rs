//! Full pipeline: scan a small library, index it, and compose a mosaic
//! whose blocks must come out the colors of the matching tiles.

use image::{Rgba, RgbaImage};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tessera::compose::{self, ComposeConfig};
use tessera::imaging::ScaleFilter;
use tessera::index::ColorIndex;
use tessera::matcher::TileMatchCache;
use tessera::scanner::scan_library;
use tessera::store::FingerprintStore;

const TILE: u32 = 8;

fn write_png(dir: &Path, name: &str, color: [u8; 4], side: u32) {
    RgbaImage::from_pixel(side, side, Rgba(color))
        .save(dir.join(name))
        .unwrap();
}

fn solid_library(dir: &Path) {
    write_png(dir, "red.png", [255, 0, 0, 255], 16);
    write_png(dir, "green.png", [0, 255, 0, 255], 16);
    write_png(dir, "blue.png", [0, 0, 255, 255], 16);
    write_png(dir, "white.png", [255, 255, 255, 255], 16);
}

#[test]
fn mosaic_blocks_match_source_pixels() {
    let tmp = TempDir::new().unwrap();
    let lib = tmp.path().join("lib");
    std::fs::create_dir(&lib).unwrap();
    solid_library(&lib);

    // 2x2 source: red / green over blue / white.
    let mut source = RgbaImage::new(2, 2);
    source.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
    source.put_pixel(1, 0, Rgba([0, 255, 0, 255]));
    source.put_pixel(0, 1, Rgba([0, 0, 255, 255]));
    source.put_pixel(1, 1, Rgba([255, 255, 255, 255]));

    let store = FingerprintStore::open(
        &tmp.path().join("store.redb"),
        "default",
        TILE,
        ScaleFilter::Nearest,
    )
    .unwrap();
    let summary = scan_library(&store, &lib, 2, true).unwrap();
    assert_eq!(summary.total, 4);

    let index = Arc::new(ColorIndex::build(store.list_all().unwrap()).unwrap());
    let cache = Arc::new(TileMatchCache::new(index, TILE, ScaleFilter::Nearest));
    let canvas = compose::compose(
        &source,
        Arc::clone(&cache),
        &ComposeConfig {
            tile_size: TILE,
            lane_count: 2,
            max_output_gb: 4,
        },
    )
    .unwrap();

    assert_eq!(canvas.dimensions(), (2 * TILE, 2 * TILE));
    // Sample the middle of each block; each source pixel has an exact
    // library match, so blocks must be solid in that color.
    assert_eq!(canvas.get_pixel(4, 4).0, [255, 0, 0, 255]);
    assert_eq!(canvas.get_pixel(12, 4).0, [0, 255, 0, 255]);
    assert_eq!(canvas.get_pixel(4, 12).0, [0, 0, 255, 255]);
    assert_eq!(canvas.get_pixel(12, 12).0, [255, 255, 255, 255]);
    // Four distinct colors means four decode passes, no more.
    assert_eq!(cache.decode_passes(), 4);
}

#[test]
fn rescan_then_compose_uses_cached_fingerprints() {
    let tmp = TempDir::new().unwrap();
    let lib = tmp.path().join("lib");
    std::fs::create_dir(&lib).unwrap();
    solid_library(&lib);

    let store = FingerprintStore::open(
        &tmp.path().join("store.redb"),
        "default",
        TILE,
        ScaleFilter::Nearest,
    )
    .unwrap();
    scan_library(&store, &lib, 2, true).unwrap();
    let second = scan_library(&store, &lib, 2, true).unwrap();
    assert_eq!(second.fingerprinted, 0);
    assert_eq!(second.cached, 4);

    let source = RgbaImage::from_pixel(1, 1, Rgba([250, 5, 5, 255]));
    let index = Arc::new(ColorIndex::build(store.list_all().unwrap()).unwrap());
    let cache = Arc::new(TileMatchCache::new(index, TILE, ScaleFilter::Nearest));
    let canvas = compose::compose(
        &source,
        cache,
        &ComposeConfig {
            tile_size: TILE,
            lane_count: 2,
            max_output_gb: 4,
        },
    )
    .unwrap();

    // Nearest tile to near-red is the red one.
    assert_eq!(canvas.get_pixel(4, 4).0, [255, 0, 0, 255]);
}

#[test]
fn encode_writes_the_composed_canvas() {
    let tmp = TempDir::new().unwrap();
    let lib = tmp.path().join("lib");
    std::fs::create_dir(&lib).unwrap();
    write_png(&lib, "gray.png", [128, 128, 128, 255], 16);

    let store = FingerprintStore::open(
        &tmp.path().join("store.redb"),
        "default",
        TILE,
        ScaleFilter::Nearest,
    )
    .unwrap();
    scan_library(&store, &lib, 2, true).unwrap();

    let source = RgbaImage::from_pixel(2, 1, Rgba([128, 128, 128, 255]));
    let index = Arc::new(ColorIndex::build(store.list_all().unwrap()).unwrap());
    let cache = Arc::new(TileMatchCache::new(index, TILE, ScaleFilter::Nearest));
    let canvas = compose::compose(
        &source,
        cache,
        &ComposeConfig {
            tile_size: TILE,
            lane_count: 1,
            max_output_gb: 4,
        },
    )
    .unwrap();

    let target = tmp.path().join("out.png");
    tessera::imaging::encode_output(canvas, &target).unwrap();
    let back = image::open(&target).unwrap().to_rgba8();
    assert_eq!(back.dimensions(), (16, 8));
    assert_eq!(back.get_pixel(3, 3).0, [128, 128, 128, 255]);
}
