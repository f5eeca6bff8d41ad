//! Crate-wide error type.
//!
//! Only run-aborting conditions live here. Per-file problems during a
//! library scan (a single image failing to decode, stat, or hash) are
//! represented by [`crate::store::SkipReason`] and never escalate — they
//! are logged, the file is skipped or evicted, and the scan continues.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open fingerprint store: {0}")]
    StoreOpen(#[from] redb::DatabaseError),

    #[error("fingerprint store transaction failed: {0}")]
    StoreTransaction(#[from] redb::TransactionError),

    #[error("fingerprint store table failed: {0}")]
    StoreTable(#[from] redb::TableError),

    #[error("fingerprint store access failed: {0}")]
    StoreAccess(#[from] redb::StorageError),

    #[error("fingerprint store commit failed: {0}")]
    StoreCommit(#[from] redb::CommitError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("unsupported output extension on {0} (expected .png, .jpg, or .jpeg)")]
    OutputFormat(PathBuf),

    #[error("output canvas would need {required_gb} GB, over the {limit_gb} GB cap")]
    OutputTooLarge { required_gb: u64, limit_gb: u64 },

    /// A stored fingerprint record could not be decoded outside the
    /// validation pass. Validation evicts corrupt records, so hitting one
    /// later means the store changed underneath us.
    #[error("corrupt fingerprint record for {0}; re-run the library scan")]
    CorruptRecord(String),

    /// A tile referenced by the store could not be decoded during
    /// composition. The matcher trusts the store between scans, so this is
    /// a store-invariant violation rather than normal staleness.
    #[error("tile {path} unusable during matching ({reason}); re-run the library scan")]
    StaleTile { path: String, reason: String },

    #[error("no usable tiles in the library after scanning")]
    EmptyLibrary,
}
