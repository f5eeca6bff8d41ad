//! Library scan: bring the fingerprint store in sync with a directory.
//!
//! Four phases, in order:
//!
//! 1. **Validate** every stored record against the filesystem and evict
//!    the stale ones in one batch.
//! 2. **Walk** the library directory (sorted, recursive) collecting
//!    supported image files as absolute paths.
//! 3. **Reconcile** the walk against the store: already-cached files are
//!    done, the rest need fingerprinting.
//! 4. **Fingerprint** the missing files on a worker pool and persist the
//!    results through a single writer thread, in walk order.
//!
//! Fingerprinting is CPU-bound and parallel; persistence is serialized
//! through one thread so the store only ever has one writer. Workers tag
//! each result with its walk index and the persister holds early
//! arrivals in a reorder buffer, so records hit the store in the same
//! order every run regardless of lane scheduling.

use crate::error::{Error, Result};
use crate::imaging;
use crate::pool::HashedWorkerPool;
use crate::progress::Progress;
use crate::store::FingerprintStore;
use crossbeam_channel::bounded;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use walkdir::WalkDir;

const FINGERPRINT_QUEUE_DEPTH: usize = 16;
/// Reorder-buffer channel between workers and the persister.
const PERSIST_QUEUE_DEPTH: usize = 256;
const SUBMIT_TIMEOUT: Duration = Duration::from_millis(10);

/// What one scan did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    /// Stale records removed by validation.
    pub evicted: usize,
    /// Supported files found by the walk.
    pub discovered: usize,
    /// Walked files that were already fingerprinted.
    pub cached: usize,
    /// Files fingerprinted and stored this run.
    pub fingerprinted: u64,
    /// Files that could not become tiles (unreadable, undecodable, or
    /// smaller than the tile size).
    pub skipped: u64,
    /// Records in the store after the scan.
    pub total: u64,
}

/// Synchronize the store with `library_dir` and report what changed.
pub fn scan_library(
    store: &FingerprintStore,
    library_dir: &Path,
    lane_count: usize,
    check_hash: bool,
) -> Result<ScanSummary> {
    let meta = std::fs::metadata(library_dir).map_err(|source| Error::Io {
        path: library_dir.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(Error::Io {
            path: library_dir.to_path_buf(),
            source: std::io::Error::new(ErrorKind::NotADirectory, "not a directory"),
        });
    }

    let stored = store.count()?;
    log::info!("scan: {stored} records on file, validating");
    let evict = store.validate_all(check_hash, lane_count)?;
    store.delete_batch(&evict)?;
    if !evict.is_empty() {
        log::info!("scan: evicted {} stale records", evict.len());
    }

    let files = walk_supported(library_dir)?;
    let (missing, cached) = store.reconcile(&files)?;
    log::info!(
        "scan: {} files on disk, {} cached, {} to fingerprint",
        files.len(),
        cached,
        missing.len()
    );

    let (fingerprinted, skipped) = fingerprint_missing(store, &missing, lane_count)?;

    Ok(ScanSummary {
        evicted: evict.len(),
        discovered: files.len(),
        cached,
        fingerprinted,
        skipped,
        total: store.count()?,
    })
}

/// Supported image files under `dir`, recursive, as absolute paths in
/// sorted walk order. That order is the persistence order downstream.
fn walk_supported(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            let path = err
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| dir.to_path_buf());
            let source = err
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walk failed"));
            Error::Io { path, source }
        })?;
        if !entry.file_type().is_file() || !imaging::is_supported(entry.path()) {
            continue;
        }
        let absolute = std::path::absolute(entry.path()).map_err(|source| Error::Io {
            path: entry.path().to_path_buf(),
            source,
        })?;
        files.push(absolute.to_string_lossy().into_owned());
    }
    Ok(files)
}

/// Fingerprint `missing` on a pool and persist results in input order.
/// Returns `(stored, skipped)`.
fn fingerprint_missing(
    store: &FingerprintStore,
    missing: &[String],
    lane_count: usize,
) -> Result<(u64, u64)> {
    if missing.is_empty() {
        return Ok((0, 0));
    }

    let progress = Arc::new(Progress::new("fingerprint", missing.len() as u64));
    let skipped = Arc::new(AtomicU64::new(0));
    // Workers send `(walk index, maybe record)`; the persister reorders.
    let (tx, rx) = bounded(PERSIST_QUEUE_DEPTH);

    let persister = {
        let store = store.clone();
        std::thread::Builder::new()
            .name("scan-persist".to_string())
            .spawn(move || -> Result<u64> {
                let mut buffer: BTreeMap<usize, Option<crate::store::TileRecord>> =
                    BTreeMap::new();
                let mut next = 0usize;
                let mut stored = 0u64;
                while let Ok((idx, maybe_record)) = rx.recv() {
                    buffer.insert(idx, maybe_record);
                    while let Some(maybe_record) = buffer.remove(&next) {
                        if let Some(record) = maybe_record {
                            store.put(&record)?;
                            stored += 1;
                        }
                        next += 1;
                    }
                }
                Ok(stored)
            })
            .expect("spawn persister")
    };

    let pool = {
        let store = store.clone();
        let progress = Arc::clone(&progress);
        let skipped = Arc::clone(&skipped);
        let tx = tx.clone();
        HashedWorkerPool::new(
            lane_count,
            FINGERPRINT_QUEUE_DEPTH,
            move |(idx, path): (usize, String)| {
                if let Ok(meta) = std::fs::metadata(&path) {
                    progress.add_bytes(meta.len());
                }
                let result = match store.fingerprint(&path) {
                    Ok(record) => Some(record),
                    Err(reason) => {
                        log::warn!("fingerprint: skipping {path} ({reason})");
                        skipped.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                };
                // Every job reports exactly once, skips included, so the
                // persister's reorder cursor never stalls.
                let _ = tx.send((idx, result));
                progress.item_done();
            },
        )
    };
    drop(tx);

    for (idx, path) in missing.iter().enumerate() {
        let mut job = (idx, path.clone());
        while let Err(returned) = pool.submit(rand::random::<i64>(), job, SUBMIT_TIMEOUT) {
            job = returned;
            progress.tick();
        }
        progress.tick();
    }
    pool.stop();
    progress.finish();

    let stored = persister.join().expect("persister thread")?;
    Ok((stored, skipped.load(Ordering::Relaxed)))
}
