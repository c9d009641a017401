//! In-Memory Manifest Backend
//!
//! A `(kind, id)`-keyed map behind a mutex plus a single `WalState`.
//! Everything is lost on process exit; this backend exists for tests and
//! single-process development where the WAL files themselves are the only
//! source of truth and recovery runs file-driven.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ManifestError, Result};
use crate::types::{
    NewCompactedSegment, RecoveryInfo, SegmentInfo, SegmentKind, SegmentStatus, WalState,
};
use crate::ManifestStore;

#[derive(Debug)]
struct MemoryState {
    segments: HashMap<(SegmentKind, u64), SegmentInfo>,
    state: WalState,
}

/// Non-durable manifest backed by process memory.
#[derive(Debug)]
pub struct MemoryManifestStore {
    inner: Mutex<MemoryState>,
}

impl Default for MemoryManifestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        MemoryManifestStore {
            inner: Mutex::new(MemoryState {
                segments: HashMap::new(),
                state: WalState::initial(),
            }),
        }
    }

    fn sorted_by_id(mut segments: Vec<SegmentInfo>) -> Vec<SegmentInfo> {
        segments.sort_by_key(|s| (s.segment_id, s.kind.as_str()));
        segments
    }
}

#[async_trait]
impl ManifestStore for MemoryManifestStore {
    async fn create_wal(&self, segment_id: u64, filename: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (SegmentKind::Wal, segment_id);
        if inner.segments.contains_key(&key) {
            return Err(ManifestError::UniqueViolation {
                kind: SegmentKind::Wal,
                segment_id,
            });
        }
        inner.segments.insert(
            key,
            SegmentInfo {
                kind: SegmentKind::Wal,
                segment_id,
                filename: filename.to_string(),
                size_bytes: 0,
                record_count: 0,
                min_lsn: None,
                max_lsn: None,
                status: SegmentStatus::Active,
                created_at: Utc::now(),
                sealed_at: None,
                checksum: None,
            },
        );
        Ok(())
    }

    async fn create_cmp(&self, segment: NewCompactedSegment) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = (SegmentKind::Cmp, segment.segment_id);
        if inner.segments.contains_key(&key) {
            return Err(ManifestError::UniqueViolation {
                kind: SegmentKind::Cmp,
                segment_id: segment.segment_id,
            });
        }
        let now = Utc::now();
        inner.segments.insert(
            key,
            SegmentInfo {
                kind: SegmentKind::Cmp,
                segment_id: segment.segment_id,
                filename: segment.filename,
                size_bytes: segment.size_bytes,
                record_count: segment.record_count,
                min_lsn: Some(segment.min_lsn),
                max_lsn: Some(segment.max_lsn),
                status: SegmentStatus::Sealed,
                created_at: now,
                sealed_at: Some(now),
                checksum: Some(segment.checksum),
            },
        );
        Ok(())
    }

    async fn seal_wal(&self, segment_id: u64, checksum: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let seg = inner
            .segments
            .get_mut(&(SegmentKind::Wal, segment_id))
            .ok_or(ManifestError::SegmentNotFound {
                kind: SegmentKind::Wal,
                segment_id,
            })?;
        if seg.status != SegmentStatus::Active {
            return Err(ManifestError::SegmentWrongStatus {
                kind: SegmentKind::Wal,
                segment_id,
                expected: SegmentStatus::Active,
                actual: seg.status,
            });
        }
        seg.status = SegmentStatus::Sealed;
        seg.sealed_at = Some(Utc::now());
        seg.checksum = Some(checksum.to_string());
        Ok(())
    }

    async fn update_wal_stats(
        &self,
        segment_id: u64,
        size_bytes: u64,
        record_count: u64,
        min_lsn: u64,
        max_lsn: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let seg = inner
            .segments
            .get_mut(&(SegmentKind::Wal, segment_id))
            .ok_or(ManifestError::SegmentNotFound {
                kind: SegmentKind::Wal,
                segment_id,
            })?;
        seg.size_bytes = size_bytes;
        seg.record_count = record_count;
        seg.min_lsn = Some(min_lsn);
        seg.max_lsn = Some(max_lsn);
        Ok(())
    }

    async fn set_wal_status(&self, segment_id: u64, status: SegmentStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let seg = inner
            .segments
            .get_mut(&(SegmentKind::Wal, segment_id))
            .ok_or(ManifestError::SegmentNotFound {
                kind: SegmentKind::Wal,
                segment_id,
            })?;
        seg.status = status;
        Ok(())
    }

    async fn list_by_status(&self, status: SegmentStatus) -> Result<Vec<SegmentInfo>> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::sorted_by_id(
            inner
                .segments
                .values()
                .filter(|s| s.status == status)
                .cloned()
                .collect(),
        ))
    }

    async fn list_sealed_wal(&self) -> Result<Vec<SegmentInfo>> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::sorted_by_id(
            inner
                .segments
                .values()
                .filter(|s| s.kind == SegmentKind::Wal && s.status == SegmentStatus::Sealed)
                .cloned()
                .collect(),
        ))
    }

    async fn archive_wal(&self, segment_ids: &[u64]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for id in segment_ids {
            if let Some(seg) = inner.segments.get_mut(&(SegmentKind::Wal, *id)) {
                seg.status = SegmentStatus::Archived;
            }
        }
        Ok(())
    }

    async fn wal_state(&self) -> Result<WalState> {
        Ok(self.inner.lock().unwrap().state.clone())
    }

    async fn set_wal_state(&self, current_segment_id: u64, next_lsn: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.current_segment_id = current_segment_id;
        inner.state.next_lsn = next_lsn;
        inner.state.updated_at = Utc::now();
        Ok(())
    }

    async fn set_checkpoint_lsn(&self, lsn: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.checkpoint_lsn = lsn;
        inner.state.updated_at = Utc::now();
        Ok(())
    }

    async fn recovery_info(&self) -> Result<RecoveryInfo> {
        let inner = self.inner.lock().unwrap();
        Ok(RecoveryInfo {
            state: inner.state.clone(),
            segments: Self::sorted_by_id(
                inner
                    .segments
                    .values()
                    .filter(|s| s.status != SegmentStatus::Archived)
                    .cloned()
                    .collect(),
            ),
        })
    }

    async fn commit_compaction_swap(
        &self,
        archive_wal_ids: &[u64],
        new_segment: NewCompactedSegment,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        // Validate before mutating so the swap stays all-or-nothing.
        let cmp_key = (SegmentKind::Cmp, new_segment.segment_id);
        if inner.segments.contains_key(&cmp_key) {
            return Err(ManifestError::UniqueViolation {
                kind: SegmentKind::Cmp,
                segment_id: new_segment.segment_id,
            });
        }
        for id in archive_wal_ids {
            if !inner.segments.contains_key(&(SegmentKind::Wal, *id)) {
                return Err(ManifestError::SegmentNotFound {
                    kind: SegmentKind::Wal,
                    segment_id: *id,
                });
            }
        }

        for id in archive_wal_ids {
            if let Some(seg) = inner.segments.get_mut(&(SegmentKind::Wal, *id)) {
                seg.status = SegmentStatus::Archived;
            }
        }
        let now = Utc::now();
        inner.segments.insert(
            cmp_key,
            SegmentInfo {
                kind: SegmentKind::Cmp,
                segment_id: new_segment.segment_id,
                filename: new_segment.filename,
                size_bytes: new_segment.size_bytes,
                record_count: new_segment.record_count,
                min_lsn: Some(new_segment.min_lsn),
                max_lsn: Some(new_segment.max_lsn),
                status: SegmentStatus::Sealed,
                created_at: now,
                sealed_at: Some(now),
                checksum: Some(new_segment.checksum),
            },
        );
        Ok(())
    }
}
