//! Memoized nearest-tile candidates, keyed by exact source color.
//!
//! A large output asks for the same source color thousands of times.
//! Without memoization each request would re-run the brute-force
//! nearest-color scan and re-decode candidate files from disk, which
//! dominates the whole run. Instead, the first query for a color pays
//! for one scan + decode pass and every later query — including
//! concurrent ones racing the first — shares the immutable result.
//!
//! Initialization is the classic double-checked pattern: a lock-free
//! `OnceLock` read first, then a per-key mutex, then a re-check under
//! the lock before doing the expensive work. Entries are immutable once
//! published and live for the whole run.

use crate::error::{Error, Result};
use crate::imaging::{self, Rgb, ScaleFilter};
use crate::index::ColorIndex;
use dashmap::DashMap;
use image::RgbaImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Default)]
struct MatchEntry {
    /// Serializes initialization only; reads never take it.
    init: Mutex<()>,
    tiles: OnceLock<Arc<Vec<RgbaImage>>>,
}

pub struct TileMatchCache {
    index: Arc<ColorIndex>,
    tile_size: u32,
    filter: ScaleFilter,
    entries: DashMap<Rgb, Arc<MatchEntry>>,
    decode_passes: AtomicU64,
    hits: AtomicU64,
}

impl TileMatchCache {
    pub fn new(index: Arc<ColorIndex>, tile_size: u32, filter: ScaleFilter) -> Self {
        Self {
            index,
            tile_size,
            filter,
            entries: DashMap::new(),
            decode_passes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// The decoded, tile-sized candidate images best matching `color`.
    ///
    /// Exactly one caller per color runs the scan-and-decode pass; every
    /// other caller gets the shared list. The list is never empty.
    pub fn candidates(&self, color: Rgb) -> Result<Arc<Vec<RgbaImage>>> {
        let entry = {
            let guard = self.entries.entry(color).or_default();
            Arc::clone(guard.value())
        };

        if let Some(tiles) = entry.tiles.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(tiles));
        }

        let _guard = entry.init.lock().unwrap();
        // Double-check: another worker may have filled the entry while we
        // waited on the lock.
        if let Some(tiles) = entry.tiles.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(tiles));
        }

        let tiles = Arc::new(self.load_candidates(color)?);
        let _ = entry.tiles.set(Arc::clone(&tiles));
        Ok(tiles)
    }

    /// How many colors went through the full scan-and-decode pass.
    pub fn decode_passes(&self) -> u64 {
        self.decode_passes.load(Ordering::Relaxed)
    }

    /// How many lookups were answered from a populated entry.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    fn load_candidates(&self, color: Rgb) -> Result<Vec<RgbaImage>> {
        self.decode_passes.fetch_add(1, Ordering::Relaxed);
        let (_, paths) = self.index.nearest(color);

        let mut tiles = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = std::fs::read(path).map_err(|err| Error::StaleTile {
                path: path.to_string(),
                reason: err.to_string(),
            })?;
            let img = image::load_from_memory(&bytes).map_err(|err| Error::StaleTile {
                path: path.to_string(),
                reason: err.to_string(),
            })?;
            let tile = imaging::prepare_tile(&img, self.tile_size, self.filter).ok_or_else(
                || Error::StaleTile {
                    path: path.to_string(),
                    reason: "smaller than the tile size".to_string(),
                },
            )?;
            tiles.push(tile);
        }
        Ok(tiles)
    }
}
