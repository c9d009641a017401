//! Storage Error Types
//!
//! This module defines all error types that can occur in the storage
//! engine.
//!
//! ## Error Categories
//!
//! ### Format Errors
//! - `Record`: codec-level failure (bad magic, CRC mismatch, payload bound)
//! - `CorruptRecord`: the same failure with file/offset context, raised
//!   while scanning a segment
//!
//! ### Catalog Errors
//! - `Manifest`: the manifest backend rejected or failed an operation
//!
//! ### I/O Errors
//! - `Io`: OS-level failure, annotated with the file it happened on
//!
//! ### State Errors
//! - `StoreClosed`, `CompactionDisabled`, `CompactionAlreadyRunning`
//!
//! ### Recovery Errors
//! - `SealedSegmentMissing`, `SealedSegmentChecksumMismatch`: fatal in
//!   manifest-assisted recovery, where sealed segments are guaranteed
//!
//! ## Usage
//!
//! All storage operations return `Result<T>` which is aliased to
//! `Result<T, Error>`. This allows clean error propagation with `?`.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("record error: {0}")]
    Record(#[from] vectorhouse_core::Error),

    #[error("corrupt record in {} at offset {offset}: {source}", path.display())]
    CorruptRecord {
        path: PathBuf,
        offset: u64,
        #[source]
        source: vectorhouse_core::Error,
    },

    #[error("manifest error: {0}")]
    Manifest(#[from] vectorhouse_metadata::ManifestError),

    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store is closed")]
    StoreClosed,

    #[error("compaction is not enabled")]
    CompactionDisabled,

    #[error("compaction already running")]
    CompactionAlreadyRunning,

    #[error("missing sealed segment file: {}", path.display())]
    SealedSegmentMissing { path: PathBuf },

    #[error(
        "sealed segment checksum mismatch for {}: catalog {expected}, file {actual}",
        path.display()
    )]
    SealedSegmentChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Error {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
