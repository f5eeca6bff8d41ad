//! Mosaic composition: one tile per source pixel, assembled in parallel.
//!
//! Every source pixel becomes one `tile × tile` block of the output
//! canvas. Blocks are independent, so composition jobs go through a
//! [`HashedWorkerPool`] routed by pseudo-random keys, and each job blits
//! its finished tile straight into the shared canvas. Blocks are written
//! exactly once by exactly one job, so the canvas needs no locking —
//! only the disjointness invariant (see [`Canvas::blit`]).
//!
//! The output size is checked against a byte cap before any allocation:
//! a 20k×20k source with 64px tiles would otherwise happily ask for a
//! multi-terabyte canvas.

use crate::error::{Error, Result};
use crate::imaging::Rgb;
use crate::matcher::TileMatchCache;
use crate::pool::HashedWorkerPool;
use crate::progress::Progress;
use image::RgbaImage;
use rand::Rng;
use std::cell::UnsafeCell;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Queue depth per composition lane.
const COMPOSE_QUEUE_DEPTH: usize = 16;
const SUBMIT_TIMEOUT: Duration = Duration::from_millis(10);

pub struct ComposeConfig {
    pub tile_size: u32,
    pub lane_count: usize,
    pub max_output_gb: u64,
}

/// Validate the output dimensions against the byte cap and return them.
/// Called before scanning so an oversized request fails before any
/// expensive work, and again by [`compose`] before allocating.
pub fn output_dimensions(
    source_w: u32,
    source_h: u32,
    tile_size: u32,
    max_output_gb: u64,
) -> Result<(u32, u32)> {
    let out_w = source_w as u64 * tile_size as u64;
    let out_h = source_h as u64 * tile_size as u64;
    let bytes = out_w * out_h * 4;
    let limit = max_output_gb * 1024 * 1024 * 1024;
    if bytes > limit {
        return Err(Error::OutputTooLarge {
            required_gb: bytes.div_ceil(1024 * 1024 * 1024),
            limit_gb: max_output_gb,
        });
    }
    Ok((out_w as u32, out_h as u32))
}

/// Output raster written concurrently by composition workers.
///
/// Interior mutability without a lock: every byte of the buffer belongs
/// to exactly one `(block_x, block_y)` region, and the composer submits
/// each block exactly once, so concurrent [`Canvas::blit`] calls never
/// touch overlapping bytes.
struct Canvas {
    width: u32,
    height: u32,
    tile_size: u32,
    pixels: Box<[UnsafeCell<u8>]>,
}

// SAFETY: all concurrent access goes through `blit`, whose callers
// uphold the one-writer-per-block invariant documented above.
unsafe impl Sync for Canvas {}

impl Canvas {
    fn new(width: u32, height: u32, tile_size: u32) -> Self {
        let len = width as usize * height as usize * 4;
        let pixels = (0..len).map(|_| UnsafeCell::new(0)).collect();
        Self {
            width,
            height,
            tile_size,
            pixels,
        }
    }

    /// Copy a `tile_size` square tile into block `(block_x, block_y)`.
    ///
    /// Callers must write each block at most once; two calls for the same
    /// block from different threads would race.
    fn blit(&self, tile: &RgbaImage, block_x: u32, block_y: u32) {
        debug_assert_eq!(tile.width(), self.tile_size);
        debug_assert_eq!(tile.height(), self.tile_size);

        let ts = self.tile_size as usize;
        let row_bytes = self.width as usize * 4;
        let src = tile.as_raw();
        for row in 0..ts {
            let dst_offset =
                (block_y as usize * ts + row) * row_bytes + block_x as usize * ts * 4;
            let src_offset = row * ts * 4;
            // SAFETY: the destination range lies entirely inside this
            // block's region, and the region has exactly one writer.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(src_offset),
                    self.pixels[dst_offset].get(),
                    ts * 4,
                );
            }
        }
    }

    fn into_image(self) -> RgbaImage {
        let buf: Vec<u8> = self.pixels.into_vec().into_iter().map(UnsafeCell::into_inner).collect();
        RgbaImage::from_raw(self.width, self.height, buf)
            .expect("canvas buffer matches its dimensions")
    }
}

struct ComposeJob {
    block_x: u32,
    block_y: u32,
    color: Rgb,
}

/// Fill the output canvas block by block and return it.
///
/// Jobs resolve their candidates through the match cache, pick uniformly
/// among distance-ties, and apply a uniformly random horizontal flip —
/// both for visual variety at zero extra lookup cost.
pub fn compose(
    source: &RgbaImage,
    cache: Arc<TileMatchCache>,
    config: &ComposeConfig,
) -> Result<RgbaImage> {
    let (out_w, out_h) = output_dimensions(
        source.width(),
        source.height(),
        config.tile_size,
        config.max_output_gb,
    )?;
    log::info!(
        "compose: {}x{} blocks -> {out_w}x{out_h} canvas",
        source.width(),
        source.height()
    );

    let canvas = Arc::new(Canvas::new(out_w, out_h, config.tile_size));
    let total_blocks = source.width() as u64 * source.height() as u64;
    let progress = Arc::new(Progress::new("compose", total_blocks));
    // First fatal error from any worker; later jobs bail out early.
    let failure: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

    let pool = {
        let canvas = Arc::clone(&canvas);
        let cache = Arc::clone(&cache);
        let progress = Arc::clone(&progress);
        let failure = Arc::clone(&failure);
        HashedWorkerPool::new(
            config.lane_count,
            COMPOSE_QUEUE_DEPTH,
            move |job: ComposeJob| {
                if failure.lock().unwrap().is_some() {
                    progress.item_done();
                    return;
                }
                match compose_block(&job, &cache, &canvas) {
                    Ok(()) => {}
                    Err(err) => {
                        let mut slot = failure.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                }
                progress.item_done();
            },
        )
    };

    for (block_x, block_y, pixel) in source.enumerate_pixels() {
        let mut job = ComposeJob {
            block_x,
            block_y,
            color: (pixel[0], pixel[1], pixel[2]),
        };
        while let Err(returned) = pool.submit(rand::random::<i64>(), job, SUBMIT_TIMEOUT) {
            job = returned;
            progress.tick();
        }
        progress.tick();
    }
    pool.stop();
    progress.finish();

    if let Some(err) = failure.lock().unwrap().take() {
        return Err(err);
    }

    let hit_percent = if total_blocks > 0 {
        cache.hits() * 100 / total_blocks
    } else {
        0
    };
    log::info!(
        "compose: {} decode passes, {}% of blocks served from cache",
        cache.decode_passes(),
        hit_percent
    );

    let canvas = Arc::into_inner(canvas).expect("composition workers stopped");
    Ok(canvas.into_image())
}

fn compose_block(job: &ComposeJob, cache: &TileMatchCache, canvas: &Canvas) -> Result<()> {
    let candidates = cache.candidates(job.color)?;

    let mut rng = rand::thread_rng();
    let pick = rng.gen_range(0..candidates.len());
    let flip: bool = rng.gen_range(0..2) == 1;

    if flip {
        let flipped = image::imageops::flip_horizontal(&candidates[pick]);
        canvas.blit(&flipped, job.block_x, job.block_y);
    } else {
        canvas.blit(&candidates[pick], job.block_x, job.block_y);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn output_dimensions_within_cap() {
        let (w, h) = output_dimensions(128, 96, 64, 4).unwrap();
        assert_eq!((w, h), (8192, 6144));
    }

    #[test]
    fn output_dimensions_rejects_over_cap() {
        // 20000 * 64 squared * 4 bytes is ~6.1 TB.
        match output_dimensions(20000, 20000, 64, 4) {
            Err(Error::OutputTooLarge { limit_gb: 4, .. }) => {}
            other => panic!("expected size cap rejection, got {other:?}"),
        }
    }

    #[test]
    fn blit_writes_exactly_one_block() {
        let canvas = Canvas::new(16, 16, 8);
        let tile = RgbaImage::from_pixel(8, 8, Rgba([1, 2, 3, 4]));
        canvas.blit(&tile, 1, 0);

        let img = canvas.into_image();
        // Inside the block:
        assert_eq!(img.get_pixel(8, 0).0, [1, 2, 3, 4]);
        assert_eq!(img.get_pixel(15, 7).0, [1, 2, 3, 4]);
        // Outside stays zeroed:
        assert_eq!(img.get_pixel(7, 0).0, [0, 0, 0, 0]);
        assert_eq!(img.get_pixel(8, 8).0, [0, 0, 0, 0]);
    }

    #[test]
    fn concurrent_disjoint_blits_land_intact() {
        let canvas = Arc::new(Canvas::new(32, 32, 8));
        let mut handles = Vec::new();
        for block in 0u32..16 {
            let canvas = Arc::clone(&canvas);
            handles.push(std::thread::spawn(move || {
                let shade = (block * 16) as u8;
                let tile = RgbaImage::from_pixel(8, 8, Rgba([shade, 0, 0, 255]));
                canvas.blit(&tile, block % 4, block / 4);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let img = Arc::into_inner(canvas).unwrap().into_image();
        for block in 0u32..16 {
            let shade = (block * 16) as u8;
            let x = (block % 4) * 8 + 4;
            let y = (block / 4) * 8 + 4;
            assert_eq!(img.get_pixel(x, y).0, [shade, 0, 0, 255]);
        }
    }
}
