//! Manifest Error Types
//!
//! ### Catalog Errors
//! - `SegmentNotFound`: no catalog row for `(kind, segment_id)`
//! - `SegmentWrongStatus`: a transition was attempted from the wrong state
//!   (e.g. sealing a segment that is not active)
//! - `UniqueViolation`: a segment was registered twice
//!
//! ### Backend Errors
//! - `Database`: the underlying SQL operation failed
//! - `TransactionFailed`: the atomic compaction swap did not commit
//! - `Migration`: schema setup failed

use thiserror::Error;

use crate::types::{SegmentKind, SegmentStatus};

pub type Result<T> = std::result::Result<T, ManifestError>;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("segment not found: {kind}/{segment_id}")]
    SegmentNotFound { kind: SegmentKind, segment_id: u64 },

    #[error("segment {kind}/{segment_id} has status {actual}, expected {expected}")]
    SegmentWrongStatus {
        kind: SegmentKind,
        segment_id: u64,
        expected: SegmentStatus,
        actual: SegmentStatus,
    },

    #[error("segment already registered: {kind}/{segment_id}")]
    UniqueViolation { kind: SegmentKind, segment_id: u64 },

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(String),
}

impl From<sqlx::migrate::MigrateError> for ManifestError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        ManifestError::Migration(e.to_string())
    }
}
