//! VectorHouse Manifest Store
//!
//! The manifest is the durable catalog the storage engine consults about
//! its own files: which segments exist, what state each is in, and where
//! the writer should resume after a restart.
//!
//! ## What the Manifest Tracks
//!
//! - **Segments**: every WAL (`wal_*.seg`) and compacted (`cmp_*.seg`)
//!   file, with size, record count, LSN range, lifecycle status and the
//!   whole-file checksum stamped at seal time
//! - **WAL state**: the current segment id, the next LSN to hand out and
//!   the checkpoint LSN
//!
//! ## Backends
//!
//! - `MemoryManifestStore`: a mutex-guarded map. Not durable; intended for
//!   tests and single-process development use.
//! - `SqliteManifestStore`: SQLite via `sqlx`, with real transactions. The
//!   compactor depends on `commit_compaction_swap` being atomic: either
//!   the inputs are archived *and* the new compacted segment is registered,
//!   or neither happened.
//!
//! ## Thread Safety
//!
//! All implementations are `Send + Sync` and are shared as
//! `Arc<dyn ManifestStore>` across the writer, recovery and the compactor.

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{ManifestError, Result};
pub use memory::MemoryManifestStore;
pub use sqlite::SqliteManifestStore;
pub use types::{
    NewCompactedSegment, RecoveryInfo, SegmentInfo, SegmentKind, SegmentStatus, WalState,
};

use async_trait::async_trait;

/// Catalog of segments plus global WAL state.
///
/// Implementations must provide read-after-write consistency: a segment
/// registered by one call is visible to the next, including across the
/// writer/compactor boundary.
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Register a new active WAL segment.
    async fn create_wal(&self, segment_id: u64, filename: &str) -> Result<()>;

    /// Register a compacted segment, created directly as sealed.
    async fn create_cmp(&self, segment: NewCompactedSegment) -> Result<()>;

    /// Transition a WAL segment `active → sealed`, stamping `sealed_at`
    /// and the whole-file checksum. Rejects segments that are not active.
    async fn seal_wal(&self, segment_id: u64, checksum: &str) -> Result<()>;

    /// Update size/count/LSN-range statistics for a WAL segment.
    async fn update_wal_stats(
        &self,
        segment_id: u64,
        size_bytes: u64,
        record_count: u64,
        min_lsn: u64,
        max_lsn: u64,
    ) -> Result<()>;

    /// Force a WAL segment into the given status. Used by the compactor
    /// for `sealed ↔ compacting` transitions and rollbacks.
    async fn set_wal_status(&self, segment_id: u64, status: SegmentStatus) -> Result<()>;

    /// All segments (both kinds) with the given status, ordered by id.
    async fn list_by_status(&self, status: SegmentStatus) -> Result<Vec<SegmentInfo>>;

    /// Sealed WAL segments only, ordered by id. Compaction input.
    async fn list_sealed_wal(&self) -> Result<Vec<SegmentInfo>>;

    /// Mark the given WAL segments archived. Missing ids are skipped.
    async fn archive_wal(&self, segment_ids: &[u64]) -> Result<()>;

    /// Current WAL state; `WalState::initial()` if never persisted.
    async fn wal_state(&self) -> Result<WalState>;

    /// Persist the current segment id and next LSN.
    async fn set_wal_state(&self, current_segment_id: u64, next_lsn: u64) -> Result<()>;

    /// Persist the checkpoint LSN.
    async fn set_checkpoint_lsn(&self, lsn: u64) -> Result<()>;

    /// State plus all non-archived segments, ordered by id.
    async fn recovery_info(&self) -> Result<RecoveryInfo>;

    /// Atomically archive the input WAL segments and register the new
    /// compacted segment. All-or-nothing: on error the catalog is
    /// unchanged.
    async fn commit_compaction_swap(
        &self,
        archive_wal_ids: &[u64],
        new_segment: NewCompactedSegment,
    ) -> Result<()>;
}
