//! Image operations shared by the scanner, matcher, and composer.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, GIF) | `image` crate (pure Rust decoders) |
//! | Center crop | `DynamicImage::crop_imm` |
//! | Rescale | `image::imageops::resize` via [`ScaleFilter`] |
//! | Encode PNG | `RgbaImage::save_with_format` |
//! | Encode JPEG | `JpegEncoder::new_with_quality` at quality 100 |
//!
//! Everything here is pure and synchronous; concurrency lives in the
//! callers.

use crate::error::{Error, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, RgbaImage};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Exact average color of a tile or source pixel.
pub type Rgb = (u8, u8, u8);

/// Extensions the library walk considers images.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif"];

/// Resampling filter used for every rescale in the pipeline.
///
/// Maps onto the `image` crate's [`FilterType`]; `bilinear` is the
/// triangle filter, `catmull-rom` the high-quality cubic default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ScaleFilter {
    Nearest,
    Bilinear,
    CatmullRom,
    Lanczos,
}

impl ScaleFilter {
    pub fn filter_type(self) -> FilterType {
        match self {
            ScaleFilter::Nearest => FilterType::Nearest,
            ScaleFilter::Bilinear => FilterType::Triangle,
            ScaleFilter::CatmullRom => FilterType::CatmullRom,
            ScaleFilter::Lanczos => FilterType::Lanczos3,
        }
    }
}

/// Output encodings selected by the target file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Jpeg,
}

/// Resolve the output encoder from the target path, rejecting anything
/// that is not `.png`, `.jpg`, or `.jpeg`. Called before any expensive
/// work so a typo'd extension fails fast.
pub fn output_format(target: &Path) -> Result<OutputFormat> {
    let ext = target
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => Ok(OutputFormat::Png),
        Some("jpg") | Some("jpeg") => Ok(OutputFormat::Jpeg),
        _ => Err(Error::OutputFormat(target.to_path_buf())),
    }
}

/// True if the path carries a decodable image extension.
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Load the source image, downscaling so its longest edge is at most
/// `max_edge` pixels. Every source pixel becomes one output tile, so this
/// bound is what keeps the output canvas tractable.
pub fn load_source(path: &Path, filter: ScaleFilter, max_edge: u32) -> Result<RgbaImage> {
    let img = image::ImageReader::open(path)
        .map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?
        .decode()
        .map_err(|source| Error::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    let (w, h) = img.dimensions();
    let longest = w.max(h);
    if longest <= max_edge {
        return Ok(img.to_rgba8());
    }

    let new_w = (w as u64 * max_edge as u64 / longest as u64) as u32;
    let new_h = (h as u64 * max_edge as u64 / longest as u64) as u32;
    log::info!("downscaling source {w}x{h} -> {new_w}x{new_h}");
    Ok(img
        .resize_exact(new_w.max(1), new_h.max(1), filter.filter_type())
        .to_rgba8())
}

/// Center-crop to a square and rescale to `tile_size` x `tile_size`.
///
/// Returns `None` when the image's short edge is smaller than the tile
/// size — upscaling library images produces mush, so they are rejected
/// instead.
pub fn prepare_tile(img: &DynamicImage, tile_size: u32, filter: ScaleFilter) -> Option<RgbaImage> {
    let (w, h) = img.dimensions();
    let side = w.min(h);
    if side < tile_size {
        return None;
    }

    let square = if w == h {
        img.clone()
    } else {
        img.crop_imm((w - side) / 2, (h - side) / 2, side, side)
    };

    let tile = if side == tile_size {
        square
    } else {
        square.resize_exact(tile_size, tile_size, filter.filter_type())
    };
    Some(tile.to_rgba8())
}

/// Average RGB over every pixel, ignoring alpha.
pub fn average_color(img: &RgbaImage) -> Rgb {
    let mut sum_r: u64 = 0;
    let mut sum_g: u64 = 0;
    let mut sum_b: u64 = 0;
    for pixel in img.pixels() {
        sum_r += pixel[0] as u64;
        sum_g += pixel[1] as u64;
        sum_b += pixel[2] as u64;
    }
    let count = (img.width() as u64 * img.height() as u64).max(1);
    (
        (sum_r / count) as u8,
        (sum_g / count) as u8,
        (sum_b / count) as u8,
    )
}

/// Log a short histogram of the source's most repeated exact colors.
/// Colors repeated at least 16 times are exactly the ones the match cache
/// will be asked about over and over, so this is a preview of how much
/// the cache will help. Diagnostics only.
pub fn log_color_histogram(img: &RgbaImage) {
    let mut counts: HashMap<Rgb, u32> = HashMap::new();
    for pixel in img.pixels() {
        *counts.entry((pixel[0], pixel[1], pixel[2])).or_default() += 1;
    }

    let mut repeated: Vec<(Rgb, u32)> = counts
        .iter()
        .filter(|&(_, &n)| n >= 16)
        .map(|(&c, &n)| (c, n))
        .collect();
    repeated.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let top = repeated.first().map(|&(_, n)| n).unwrap_or(0);
    log::info!(
        "source: {} distinct colors, {} repeated >=16 times (top {})",
        counts.len(),
        repeated.len(),
        top
    );
    for ((r, g, b), n) in repeated.iter().take(10) {
        log::info!("source: color r {r} g {g} b {b} appears {n} times");
    }
}

/// Encode the finished canvas to the target path. PNG keeps the RGBA
/// buffer as-is; JPEG drops alpha and encodes at quality 100.
pub fn encode_output(canvas: RgbaImage, target: &Path) -> Result<()> {
    match output_format(target)? {
        OutputFormat::Png => canvas
            .save_with_format(target, ImageFormat::Png)
            .map_err(|source| Error::Encode {
                path: target.to_path_buf(),
                source,
            }),
        OutputFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(canvas).into_rgb8();
            let file = File::create(target).map_err(|source| Error::Io {
                path: target.to_path_buf(),
                source,
            })?;
            let mut writer = BufWriter::new(file);
            JpegEncoder::new_with_quality(&mut writer, 100)
                .encode_image(&rgb)
                .map_err(|source| Error::Encode {
                    path: target.to_path_buf(),
                    source,
                })
        }
    }
}
