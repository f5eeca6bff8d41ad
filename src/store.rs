//! Persistent tile-fingerprint store.
//!
//! Maps an absolute library file path to its [`TileRecord`] — average
//! color plus a content hash — inside a `redb` database. One table per
//! `(library name, tile size)` pair, so multiple libraries and tile sizes
//! share a single store file without colliding.
//!
//! # Keys and values
//!
//! Keys are absolute paths (`&str`), values are JSON-encoded records.
//! The content hash is xxh3-128 over the raw file bytes: content-based
//! rather than mtime-based, so a `git checkout` or `touch` doesn't
//! invalidate anything — only actual byte changes do.
//!
//! # Iteration order
//!
//! `redb` iterates keys in lexicographic byte order. That order is part
//! of this crate's contract: it is the deterministic tie-break the color
//! index uses when several distinct colors are equidistant from a query.
//!
//! # Writers
//!
//! Reads are concurrent (one read transaction per caller); writes go
//! through two narrow paths only — the scan's single persister thread
//! calling [`FingerprintStore::put`], and one batched
//! [`FingerprintStore::delete_batch`] after validation.

use crate::error::Result;
use crate::imaging::{self, Rgb, ScaleFilter};
use crate::pool::HashedWorkerPool;
use crate::progress::Progress;
use redb::{Database, ReadableTable, TableDefinition};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_128;

/// Queue depth per pool lane during validation.
const VALIDATE_QUEUE_DEPTH: usize = 16;
/// How long a producer waits on a full lane before retrying.
const SUBMIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Average color and content hash for one library file.
///
/// Owned exclusively by the store: created by fingerprinting, replaced
/// wholesale on re-fingerprint, deleted when validation finds the file
/// gone, undecodable, or changed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TileRecord {
    pub path: String,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub content_hash: String,
}

impl TileRecord {
    pub fn color(&self) -> Rgb {
        (self.r, self.g, self.b)
    }
}

/// Why a single library file was skipped during fingerprinting.
/// Never fatal: the file is logged and excluded, the scan continues.
#[derive(Debug, Error)]
pub enum SkipReason {
    #[error("read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("{width}x{height} is smaller than the {tile_size}px tile")]
    TooSmall {
        width: u32,
        height: u32,
        tile_size: u32,
    },
}

#[derive(Clone)]
pub struct FingerprintStore {
    db: Arc<Database>,
    bucket: String,
    tile_size: u32,
    filter: ScaleFilter,
}

impl FingerprintStore {
    /// Open (or create) the store file and the bucket for this
    /// `(library name, tile size)` pair. Failure here is fatal to the run.
    pub fn open(
        path: &Path,
        library_name: &str,
        tile_size: u32,
        filter: ScaleFilter,
    ) -> Result<Self> {
        let db = Database::create(path)?;
        let bucket = format!("fingerprints/{library_name}/{tile_size}");

        // Create the table up front so read transactions never race a
        // missing bucket.
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(table_def(&bucket))?;
        }
        txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            bucket,
            tile_size,
            filter,
        })
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn filter(&self) -> ScaleFilter {
        self.filter
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<u64> {
        Ok(self.raw_entries()?.len() as u64)
    }

    /// Every stored record, in lexicographic path order, decoded.
    ///
    /// Validation evicts undecodable records, so hitting one here is a
    /// store-invariant violation and fatal.
    pub fn list_all(&self) -> Result<Vec<TileRecord>> {
        let mut records = Vec::new();
        for (path, value) in self.raw_entries()? {
            let record = serde_json::from_slice(&value)
                .map_err(|_| crate::error::Error::CorruptRecord(path))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Raw `(path, value bytes)` pairs in lexicographic path order,
    /// without decoding. Used by validation, which treats an undecodable
    /// value as an eviction candidate rather than an error.
    pub fn raw_entries(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table_def(&self.bucket))?;
        let mut entries = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            entries.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(entries)
    }

    /// Split candidate paths into those missing from the store (need
    /// fingerprinting, input order preserved) and the count already
    /// cached. Read-only.
    pub fn reconcile(&self, candidates: &[String]) -> Result<(Vec<String>, usize)> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(table_def(&self.bucket))?;
        let mut missing = Vec::new();
        let mut cached = 0usize;
        for path in candidates {
            if table.get(path.as_str())?.is_some() {
                cached += 1;
            } else {
                missing.push(path.clone());
            }
        }
        Ok((missing, cached))
    }

    /// Compute the fingerprint for one library file: content hash over
    /// the raw bytes, then decode, center-crop, rescale to the tile size,
    /// and average. Does not touch the store — persistence is the
    /// scanner's single-writer job.
    pub fn fingerprint(&self, path: &str) -> std::result::Result<TileRecord, SkipReason> {
        let bytes = std::fs::read(path)?;
        let content_hash = format!("{:032x}", xxh3_128(&bytes));

        let img = image::load_from_memory(&bytes)?;
        let (width, height) = (img.width(), img.height());
        let tile = imaging::prepare_tile(&img, self.tile_size, self.filter).ok_or(
            SkipReason::TooSmall {
                width,
                height,
                tile_size: self.tile_size,
            },
        )?;
        let (r, g, b) = imaging::average_color(&tile);

        Ok(TileRecord {
            path: path.to_string(),
            r,
            g,
            b,
            content_hash,
        })
    }

    /// Durably store one record, keyed by its path.
    pub fn put(&self, record: &TileRecord) -> Result<()> {
        let value = serde_json::to_vec(record).expect("TileRecord serializes");
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table_def(&self.bucket))?;
            table.insert(record.path.as_str(), value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove a set of records in one atomic transaction. Applied only
    /// after validation finishes iterating, never interleaved with it.
    pub fn delete_batch(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(table_def(&self.bucket))?;
            for path in paths {
                table.remove(path.as_str())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Check every stored record against the filesystem and return the
    /// paths to evict: file gone, record undecodable, or (with
    /// `check_hash`) content hash mismatch. Records whose files merely
    /// fail to open for the hash re-check are kept — only a confirmed
    /// mismatch evicts.
    ///
    /// Each record is one pool job routed by a pseudo-random key;
    /// validation jobs are independent, so routing only spreads load.
    /// The store itself is not mutated here.
    pub fn validate_all(&self, check_hash: bool, lane_count: usize) -> Result<Vec<String>> {
        let entries = self.raw_entries()?;
        let progress = Arc::new(Progress::new("validate", entries.len() as u64));
        let evict = Arc::new(Mutex::new(Vec::new()));

        let pool = {
            let progress = Arc::clone(&progress);
            let evict = Arc::clone(&evict);
            HashedWorkerPool::new(
                lane_count,
                VALIDATE_QUEUE_DEPTH,
                move |(path, value): (String, Vec<u8>)| {
                    validate_entry(&path, &value, check_hash, &evict, &progress);
                    progress.item_done();
                },
            )
        };

        for entry in entries {
            let mut job = entry;
            while let Err(returned) = pool.submit(rand::random::<i64>(), job, SUBMIT_TIMEOUT) {
                job = returned;
                progress.tick();
            }
            progress.tick();
        }
        pool.stop();
        progress.finish();

        let evict = Arc::into_inner(evict)
            .expect("validation workers stopped")
            .into_inner()
            .expect("eviction list lock");
        Ok(evict)
    }
}

/// One validation job. Pushes onto `evict` when the record must go.
fn validate_entry(
    path: &str,
    value: &[u8],
    check_hash: bool,
    evict: &Mutex<Vec<String>>,
    progress: &Progress,
) {
    let record: TileRecord = match serde_json::from_slice(value) {
        Ok(record) => record,
        Err(err) => {
            log::warn!("validate: undecodable record for {path}, evicting ({err})");
            evict.lock().unwrap().push(path.to_string());
            return;
        }
    };

    match std::fs::metadata(&record.path) {
        Ok(meta) => progress.add_bytes(meta.len()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            log::warn!("validate: {path} no longer exists, evicting");
            evict.lock().unwrap().push(path.to_string());
            return;
        }
        Err(err) => {
            log::warn!("validate: stat failed for {path}, keeping ({err})");
            return;
        }
    }

    if check_hash {
        let bytes = match std::fs::read(&record.path) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("validate: read failed for {path}, keeping ({err})");
                return;
            }
        };
        let actual = format!("{:032x}", xxh3_128(&bytes));
        if actual != record.content_hash {
            log::warn!("validate: content changed for {path}, evicting");
            evict.lock().unwrap().push(path.to_string());
        }
    }
}

fn table_def(bucket: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(bucket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, name: &str) -> FingerprintStore {
        FingerprintStore::open(&dir.path().join("store.redb"), name, 8, ScaleFilter::Nearest)
            .unwrap()
    }

    fn write_solid_png(dir: &TempDir, name: &str, color: [u8; 4], side: u32) -> String {
        let path = dir.path().join(name);
        RgbaImage::from_pixel(side, side, Rgba(color))
            .save(&path)
            .unwrap();
        std::path::absolute(&path)
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    fn record(path: &str, color: (u8, u8, u8), hash: &str) -> TileRecord {
        TileRecord {
            path: path.to_string(),
            r: color.0,
            g: color.1,
            b: color.2,
            content_hash: hash.to_string(),
        }
    }

    // =========================================================================
    // Round-trips and bucket layout
    // =========================================================================

    #[test]
    fn put_then_list_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        let rec = record("/lib/a.png", (1, 2, 3), "abc123");
        store.put(&rec).unwrap();

        let all = store.list_all().unwrap();
        assert_eq!(all, vec![rec]);
    }

    #[test]
    fn list_all_is_lexicographic_by_path() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        store.put(&record("/lib/b.png", (0, 0, 0), "h")).unwrap();
        store.put(&record("/lib/a.png", (0, 0, 0), "h")).unwrap();
        store.put(&record("/lib/c.png", (0, 0, 0), "h")).unwrap();

        let paths: Vec<_> = store.list_all().unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/lib/a.png", "/lib/b.png", "/lib/c.png"]);
    }

    #[test]
    fn buckets_namespace_by_library_name() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open_store(&tmp, "cats");
            store.put(&record("/lib/a.png", (1, 1, 1), "h")).unwrap();
        }
        let other = open_store(&tmp, "dogs");
        assert_eq!(other.count().unwrap(), 0);
    }

    #[test]
    fn reconcile_splits_missing_and_cached() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        store.put(&record("/lib/known.png", (0, 0, 0), "h")).unwrap();

        let candidates = vec![
            "/lib/known.png".to_string(),
            "/lib/new1.png".to_string(),
            "/lib/new2.png".to_string(),
        ];
        let (missing, cached) = store.reconcile(&candidates).unwrap();
        assert_eq!(cached, 1);
        assert_eq!(missing, vec!["/lib/new1.png", "/lib/new2.png"]);
    }

    #[test]
    fn delete_batch_removes_only_named_paths() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        store.put(&record("/lib/a.png", (0, 0, 0), "h")).unwrap();
        store.put(&record("/lib/b.png", (0, 0, 0), "h")).unwrap();

        store.delete_batch(&["/lib/a.png".to_string()]).unwrap();
        let paths: Vec<_> = store.list_all().unwrap().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/lib/b.png"]);
    }

    // =========================================================================
    // Fingerprinting
    // =========================================================================

    #[test]
    fn fingerprint_solid_image_yields_exact_color() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        let path = write_solid_png(&tmp, "red.png", [200, 10, 30, 255], 16);

        let rec = store.fingerprint(&path).unwrap();
        assert_eq!(rec.color(), (200, 10, 30));
        assert_eq!(rec.path, path);
        assert_eq!(rec.content_hash.len(), 32);
    }

    #[test]
    fn fingerprint_hash_tracks_content() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        let path = write_solid_png(&tmp, "a.png", [5, 5, 5, 255], 16);

        let first = store.fingerprint(&path).unwrap();
        let second = store.fingerprint(&path).unwrap();
        assert_eq!(first.content_hash, second.content_hash);

        RgbaImage::from_pixel(16, 16, Rgba([6, 6, 6, 255]))
            .save(&path)
            .unwrap();
        let changed = store.fingerprint(&path).unwrap();
        assert_ne!(first.content_hash, changed.content_hash);
    }

    #[test]
    fn fingerprint_skips_undecodable_file() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        let path = tmp.path().join("junk.png");
        std::fs::write(&path, b"not an image").unwrap();

        match store.fingerprint(path.to_str().unwrap()) {
            Err(SkipReason::Decode(_)) => {}
            other => panic!("expected decode skip, got {other:?}"),
        }
    }

    #[test]
    fn fingerprint_skips_too_small_image() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        let path = write_solid_png(&tmp, "tiny.png", [1, 1, 1, 255], 4);

        match store.fingerprint(&path) {
            Err(SkipReason::TooSmall { tile_size: 8, .. }) => {}
            other => panic!("expected too-small skip, got {other:?}"),
        }
    }

    #[test]
    fn fingerprint_skips_missing_file() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        match store.fingerprint("/nonexistent/file.png") {
            Err(SkipReason::Read(_)) => {}
            other => panic!("expected read skip, got {other:?}"),
        }
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn validate_keeps_intact_records() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        let path = write_solid_png(&tmp, "a.png", [9, 9, 9, 255], 16);
        store.put(&store.fingerprint(&path).unwrap()).unwrap();

        let evict = store.validate_all(true, 2).unwrap();
        assert!(evict.is_empty());
    }

    #[test]
    fn validate_evicts_missing_file() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        let path = write_solid_png(&tmp, "gone.png", [9, 9, 9, 255], 16);
        store.put(&store.fingerprint(&path).unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        let evict = store.validate_all(false, 2).unwrap();
        assert_eq!(evict, vec![path]);
    }

    #[test]
    fn validate_evicts_changed_content_only_with_check_hash() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        let path = write_solid_png(&tmp, "mut.png", [9, 9, 9, 255], 16);
        store.put(&store.fingerprint(&path).unwrap()).unwrap();
        RgbaImage::from_pixel(16, 16, Rgba([10, 10, 10, 255]))
            .save(&path)
            .unwrap();

        assert!(store.validate_all(false, 2).unwrap().is_empty());
        assert_eq!(store.validate_all(true, 2).unwrap(), vec![path]);
    }

    #[test]
    fn validate_evicts_corrupt_record() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        // Write garbage bytes directly under a key.
        let txn = store.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(table_def(&store.bucket)).unwrap();
            table.insert("/lib/bad.png", b"garbage".as_slice()).unwrap();
        }
        txn.commit().unwrap();

        let evict = store.validate_all(false, 2).unwrap();
        assert_eq!(evict, vec!["/lib/bad.png"]);
    }

    #[test]
    fn list_all_rejects_corrupt_record() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp, "default");
        let txn = store.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(table_def(&store.bucket)).unwrap();
            table.insert("/lib/bad.png", b"garbage".as_slice()).unwrap();
        }
        txn.commit().unwrap();

        assert!(matches!(
            store.list_all(),
            Err(crate::error::Error::CorruptRecord(_))
        ));
    }
}
