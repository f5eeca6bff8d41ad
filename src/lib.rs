//! # Tessera
//!
//! A photomosaic generator: rebuild a source image out of thousands of
//! small library photos, matched by average color.
//!
//! # Architecture: Scan, Index, Compose
//!
//! A run moves through three stages over one persistent store:
//!
//! ```text
//! 1. Scan     library/  →  fingerprint store   (validate, walk, fingerprint)
//! 2. Index    store     →  in-memory index     (dense color counts + records)
//! 3. Compose  source    →  mosaic canvas       (one tile per source pixel)
//! ```
//!
//! The store is the only thing that persists between runs: fingerprinting
//! a large library is expensive, so average colors and content hashes are
//! computed once and revalidated cheaply on every run. Everything else is
//! rebuilt per run from that snapshot.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`scanner`] | Library scan driver — validate, walk, reconcile, fingerprint, persist |
//! | [`store`] | Persistent path → (average color, content hash) records in `redb` |
//! | [`index`] | Dense per-color counts and brute-force nearest-color lookup |
//! | [`matcher`] | Memoized nearest-tile candidates with double-checked lazy init |
//! | [`compose`] | Parallel canvas assembly, one decoded tile per source pixel |
//! | [`pool`] | Fixed-lane worker pool with key-hash routing and bounded queues |
//! | [`imaging`] | Decode, center-crop, rescale, average-color, and output encoding |
//! | [`progress`] | Throttled per-phase progress logging with throughput |
//! | [`error`] | Crate-wide error type |
//!
//! # Design Decisions
//!
//! ## Content Hashes, Not Mtimes
//!
//! Cached fingerprints are keyed to an xxh3-128 hash of the file bytes.
//! Re-downloading or re-checking-out a library leaves the cache intact;
//! only real content changes force re-fingerprinting. The hash re-check
//! can be disabled per run when the library is known to be static.
//!
//! ## Deterministic Matching, Random Presentation
//!
//! Nearest-color matching is exact and deterministic: a brute-force scan
//! over records in lexicographic path order, with distance ties between
//! distinct colors resolved to the first path found. Randomness enters
//! only at presentation time — which of several equally-near tiles fills
//! a given block, and whether it is mirrored — so the same library always
//! produces the same *palette* even though no two mosaics are identical.
//!
//! ## One Writer, Many Readers
//!
//! All store writes flow through a single thread (the scan persister) or
//! a single batched transaction (post-validation eviction). Workers only
//! read. That keeps the store free of write contention without any
//! locking discipline spread across the codebase.

pub mod compose;
pub mod error;
pub mod imaging;
pub mod index;
pub mod matcher;
pub mod pool;
pub mod progress;
pub mod scanner;
pub mod store;
