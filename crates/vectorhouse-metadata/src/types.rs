//! Manifest Data Types
//!
//! Catalog records for segments plus the global WAL state singleton.
//! A segment is identified by `(kind, segment_id)`: the WAL writer and the
//! compactor allocate ids independently, so the same number can appear in
//! both namespaces without colliding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which namespace a segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    /// Written live by the WAL writer (`wal_*.seg`).
    Wal,
    /// Produced by the compactor (`cmp_*.seg`).
    Cmp,
}

impl SegmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentKind::Wal => "wal",
            SegmentKind::Cmp => "cmp",
        }
    }

    pub fn parse(s: &str) -> Option<SegmentKind> {
        match s {
            "wal" => Some(SegmentKind::Wal),
            "cmp" => Some(SegmentKind::Cmp),
            _ => None,
        }
    }
}

impl std::fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a segment.
///
/// WAL segments move `active → sealed → compacting → archived`; compacted
/// segments are created directly as `sealed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Active,
    Sealed,
    Compacting,
    Archived,
}

impl SegmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentStatus::Active => "active",
            SegmentStatus::Sealed => "sealed",
            SegmentStatus::Compacting => "compacting",
            SegmentStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<SegmentStatus> {
        match s {
            "active" => Some(SegmentStatus::Active),
            "sealed" => Some(SegmentStatus::Sealed),
            "compacting" => Some(SegmentStatus::Compacting),
            "archived" => Some(SegmentStatus::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog record for one segment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub kind: SegmentKind,
    pub segment_id: u64,
    pub filename: String,
    pub size_bytes: u64,
    pub record_count: u64,
    pub min_lsn: Option<u64>,
    pub max_lsn: Option<u64>,
    pub status: SegmentStatus,
    pub created_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
    /// Lowercase 8-char hex of the whole-file IEEE CRC32, stamped at seal.
    pub checksum: Option<String>,
}

/// Global WAL state singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalState {
    pub current_segment_id: u64,
    pub next_lsn: u64,
    pub checkpoint_lsn: u64,
    pub updated_at: DateTime<Utc>,
}

impl WalState {
    /// State of a WAL directory that has never been written.
    pub fn initial() -> WalState {
        WalState {
            current_segment_id: 1,
            next_lsn: 1,
            checkpoint_lsn: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Everything recovery needs in one read: the state plus all non-archived
/// segments, ordered by segment id.
#[derive(Debug, Clone)]
pub struct RecoveryInfo {
    pub state: WalState,
    pub segments: Vec<SegmentInfo>,
}

/// Descriptor for a freshly written compacted segment, registered in the
/// same transaction that archives its inputs.
#[derive(Debug, Clone)]
pub struct NewCompactedSegment {
    pub segment_id: u64,
    pub filename: String,
    pub size_bytes: u64,
    pub record_count: u64,
    pub min_lsn: u64,
    pub max_lsn: u64,
    pub checksum: String,
}
