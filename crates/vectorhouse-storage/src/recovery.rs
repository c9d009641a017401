//! WAL Recovery
//!
//! Rebuilds the in-memory index from segment files on cold start. Two
//! entry points, both idempotent:
//!
//! - [`RecoveryManager::recover`] is manifest-assisted and strict: sealed
//!   segments must exist and match their catalog checksum, because the
//!   catalog promised they were durably committed
//! - [`RecoveryManager::recover_without_manifest`] is file-driven and
//!   permissive: it scans whatever segments are on disk, stops a
//!   segment's scan at the first corrupt byte and moves on. Tail
//!   corruption is the expected post-crash state and is complemented by
//!   the writer's open-time tail repair
//!
//! Both paths apply records under the same rule: a per-document
//! last-seen-LSN map gives last-write-wins regardless of the order
//! segments are visited in. Tombstones remove, writes insert, checkpoint
//! and unknown records are informational.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use vectorhouse_core::record::{decode_delete_payload, decode_doc_payload};
use vectorhouse_core::{Document, Record, RecordType};
use vectorhouse_metadata::{ManifestStore, SegmentStatus};

use crate::error::{Error, Result};
use crate::index::MemIndex;
use crate::segment::list_all_segments;
use crate::segment::reader::{segment_checksum, SegmentIterator};

/// Counters describing one recovery pass.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub segments_loaded: usize,
    pub records_loaded: usize,
    pub tombstones_applied: usize,
    pub corrupt_records: usize,
    pub max_lsn: u64,
    pub elapsed: Duration,
}

/// Replays segments into an index on cold start.
pub struct RecoveryManager {
    manifest: Arc<dyn ManifestStore>,
    wal_dir: PathBuf,
    index: Arc<MemIndex>,
}

impl RecoveryManager {
    pub fn new(
        manifest: Arc<dyn ManifestStore>,
        wal_dir: impl Into<PathBuf>,
        index: Arc<MemIndex>,
    ) -> RecoveryManager {
        RecoveryManager {
            manifest,
            wal_dir: wal_dir.into(),
            index,
        }
    }

    /// Manifest-assisted recovery. Sealed segments are verified against
    /// their catalog checksum; a missing or mismatching sealed segment is
    /// fatal. Records at or below the checkpoint LSN are skipped.
    pub async fn recover(&self) -> Result<RecoveryStats> {
        let start = Instant::now();
        let mut stats = RecoveryStats::default();

        let info = self.manifest.recovery_info().await?;
        let mut segments = info.segments;
        segments.sort_by_key(|s| s.segment_id);

        let mut doc_lsn: HashMap<String, u64> = HashMap::new();

        for seg in &segments {
            let path = PathBuf::from(&seg.filename);
            let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);

            if seg.status == SegmentStatus::Sealed {
                if !exists {
                    return Err(Error::SealedSegmentMissing { path });
                }
                if let Some(expected) = &seg.checksum {
                    let actual = segment_checksum(&path).await?;
                    if actual != *expected {
                        return Err(Error::SealedSegmentChecksumMismatch {
                            path,
                            expected: expected.clone(),
                            actual,
                        });
                    }
                }
            } else if !exists {
                continue;
            }

            let mut iter =
                SegmentIterator::open_from_lsn(&path, info.state.checkpoint_lsn + 1).await?;
            loop {
                match iter.next().await {
                    Ok(Some(record)) => self.consume(&record, &mut doc_lsn, &mut stats),
                    Ok(None) => break,
                    // The active segment may legitimately end mid-record
                    // after a crash; a sealed one may not.
                    Err(e) if seg.status == SegmentStatus::Active => {
                        stats.corrupt_records += 1;
                        warn!(segment = %path.display(), error = %e, "stopping active segment scan at corruption");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            stats.segments_loaded += 1;
        }

        stats.elapsed = start.elapsed();
        info!(
            segments = stats.segments_loaded,
            records = stats.records_loaded,
            tombstones = stats.tombstones_applied,
            corrupt = stats.corrupt_records,
            max_lsn = stats.max_lsn,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "manifest-assisted recovery complete"
        );
        Ok(stats)
    }

    /// File-driven recovery: scan every segment file in the WAL directory
    /// in id order, tolerating per-segment corruption.
    pub async fn recover_without_manifest(&self) -> Result<RecoveryStats> {
        let start = Instant::now();
        let mut stats = RecoveryStats::default();

        let segments = list_all_segments(&self.wal_dir).await?;
        if segments.is_empty() {
            stats.elapsed = start.elapsed();
            return Ok(stats);
        }

        let mut doc_lsn: HashMap<String, u64> = HashMap::new();

        for path in &segments {
            let mut iter = match SegmentIterator::open(path).await {
                Ok(iter) => iter,
                Err(e) => {
                    warn!(segment = %path.display(), error = %e, "skipping unreadable segment");
                    continue;
                }
            };

            let mut segment_corrupt = false;
            loop {
                match iter.next().await {
                    Ok(Some(record)) => self.consume(&record, &mut doc_lsn, &mut stats),
                    Ok(None) => break,
                    Err(e) => {
                        // Expected for the segment that was being written
                        // when the process died; the writer truncates the
                        // same tail on its next open.
                        stats.corrupt_records += 1;
                        segment_corrupt = true;
                        warn!(segment = %path.display(), error = %e, "stopping segment scan at corruption");
                        break;
                    }
                }
            }
            if !segment_corrupt {
                stats.segments_loaded += 1;
            }
        }

        stats.elapsed = start.elapsed();
        info!(
            segments = stats.segments_loaded,
            records = stats.records_loaded,
            tombstones = stats.tombstones_applied,
            corrupt = stats.corrupt_records,
            max_lsn = stats.max_lsn,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "file-driven recovery complete"
        );
        Ok(stats)
    }

    fn consume(
        &self,
        record: &Record,
        doc_lsn: &mut HashMap<String, u64>,
        stats: &mut RecoveryStats,
    ) {
        stats.records_loaded += 1;
        if record.lsn > stats.max_lsn {
            stats.max_lsn = record.lsn;
        }
        match self.apply_record(record, doc_lsn) {
            Ok(()) => {
                if record.record_type == RecordType::Delete {
                    stats.tombstones_applied += 1;
                }
            }
            Err(e) => {
                stats.corrupt_records += 1;
                warn!(lsn = record.lsn, error = %e, "skipping undecodable record");
            }
        }
    }

    /// LSN last-write-wins apply rule, shared by both recovery paths.
    fn apply_record(
        &self,
        record: &Record,
        doc_lsn: &mut HashMap<String, u64>,
    ) -> vectorhouse_core::Result<()> {
        match record.record_type {
            RecordType::Insert | RecordType::Update => {
                let (doc_id, meta, embedding) = decode_doc_payload(&record.payload)?;
                if Self::is_stale(doc_lsn, &doc_id, record.lsn) {
                    return Ok(());
                }
                doc_lsn.insert(doc_id.clone(), record.lsn);
                self.index.set_recovered(Document {
                    id: doc_id,
                    source: meta.source,
                    title: meta.title,
                    text: meta.text,
                    metadata: meta.metadata,
                    created_at: meta.created_at,
                    embedding,
                });
            }
            RecordType::Delete => {
                let doc_id = decode_delete_payload(&record.payload)?;
                if Self::is_stale(doc_lsn, &doc_id, record.lsn) {
                    return Ok(());
                }
                doc_lsn.insert(doc_id.clone(), record.lsn);
                self.index.delete(&doc_id);
            }
            RecordType::Checkpoint | RecordType::Unknown(_) => {}
        }
        Ok(())
    }

    fn is_stale(doc_lsn: &HashMap<String, u64>, doc_id: &str, lsn: u64) -> bool {
        doc_lsn.get(doc_id).is_some_and(|seen| *seen >= lsn)
    }

    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }
}
