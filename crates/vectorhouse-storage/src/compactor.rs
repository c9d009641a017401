//! Segment Compactor
//!
//! Merges sealed WAL segments into one compacted segment, reclaiming the
//! space taken by superseded versions and deleted documents. Runs on a
//! timer (default: every 5 minutes) or on demand via `force_compact`.
//!
//! ## Merge Rule
//!
//! For every document the merge keeps only the record with the highest
//! LSN among INSERT/UPDATE/DELETE. Tombstones are **written to the
//! output**: an older compacted segment may still hold the document's
//! INSERT, and only the surviving tombstone keeps it dead across the next
//! recovery.
//!
//! ## Atomicity
//!
//! Inputs are flipped `sealed → compacting` up front; the merged output
//! is written into a scratch directory, renamed into the compacted
//! namespace, and then one manifest transaction archives the inputs and
//! registers the output. Any failure rolls the inputs back to `sealed` on
//! a detached task with its own timeout, so a cancelled caller cannot
//! strand segments in `compacting`. Input files are unlinked only after
//! the swap commits; the catalog is the source of truth, so a failed
//! unlink is logged and left for the next sweep.
//!
//! ## Concurrency
//!
//! At most one run at a time (`try_lock`, otherwise
//! `CompactionAlreadyRunning`). Compaction only touches sealed segments
//! and its own id namespace, so it never interferes with live appends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use vectorhouse_core::record::{decode_delete_payload, decode_doc_payload};
use vectorhouse_core::{Record, RecordType};
use vectorhouse_metadata::{ManifestStore, NewCompactedSegment, SegmentInfo, SegmentStatus};

use crate::config::CompactionConfig;
use crate::error::{Error, Result};
use crate::segment::cmp_filename;
use crate::segment::reader::{segment_checksum, SegmentIterator};
use crate::segment::writer::SegmentWriter;

/// Upper bound on rollback work after a failed run. Rollbacks run on a
/// detached task so caller cancellation cannot interrupt them.
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Compactor {
    manifest: Arc<dyn ManifestStore>,
    segment_dir: PathBuf,
    config: CompactionConfig,
    run_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Compactor {
    pub fn new(
        manifest: Arc<dyn ManifestStore>,
        segment_dir: impl Into<PathBuf>,
        config: CompactionConfig,
    ) -> Compactor {
        let (shutdown_tx, _) = watch::channel(false);
        Compactor {
            manifest,
            segment_dir: segment_dir.into(),
            config,
            run_lock: Mutex::new(()),
            shutdown_tx,
            task: std::sync::Mutex::new(None),
        }
    }

    fn tmp_dir(&self) -> PathBuf {
        self.config
            .tmp_dir
            .clone()
            .unwrap_or_else(|| self.segment_dir.join(".tmp"))
    }

    /// Start the background loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let tmp_dir = self.tmp_dir();
        tokio::fs::create_dir_all(&tmp_dir)
            .await
            .map_err(|e| Error::io(&tmp_dir, e))?;

        let compactor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh store
            // does not compact during startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match compactor.compact().await {
                            Ok(()) => {}
                            Err(Error::CompactionAlreadyRunning) => {}
                            Err(e) => warn!(error = %e, "scheduled compaction failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the background loop and wait for it to exit.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// One scheduled-style run: no-op unless at least
    /// `min_segments_to_compact` sealed WAL segments exist.
    pub async fn compact(&self) -> Result<()> {
        self.run(false).await
    }

    /// On-demand run: ignores the minimum-segment threshold but still
    /// needs two inputs to be worth a merge.
    pub async fn force_compact(&self) -> Result<()> {
        self.run(true).await
    }

    async fn run(&self, force: bool) -> Result<()> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| Error::CompactionAlreadyRunning)?;

        let mut segments = self.manifest.list_sealed_wal().await?;
        if !force && segments.len() < self.config.min_segments_to_compact {
            return Ok(());
        }
        segments.sort_by_key(|s| s.segment_id);
        if segments.len() > self.config.max_segments_per_compaction {
            segments.truncate(self.config.max_segments_per_compaction);
        }
        if segments.len() < 2 {
            return Ok(());
        }

        self.compact_segments(segments).await
    }

    async fn compact_segments(&self, segments: Vec<SegmentInfo>) -> Result<()> {
        let ids: Vec<u64> = segments.iter().map(|s| s.segment_id).collect();

        // Claim the inputs.
        let mut marked: Vec<u64> = Vec::new();
        for seg in &segments {
            if let Err(e) = self
                .manifest
                .set_wal_status(seg.segment_id, SegmentStatus::Compacting)
                .await
            {
                self.rollback_to_sealed(marked).await;
                return Err(e.into());
            }
            marked.push(seg.segment_id);
        }

        let merged = match self.merge_records(&segments).await {
            Ok(merged) => merged,
            Err(e) => {
                self.rollback_to_sealed(ids).await;
                return Err(e);
            }
        };

        if merged.is_empty() {
            // Nothing survived the merge (e.g. segments full of
            // checkpoints): archive the inputs and drop their files.
            if let Err(e) = self.manifest.archive_wal(&ids).await {
                self.rollback_to_sealed(ids).await;
                return Err(e.into());
            }
            self.unlink_inputs(&segments).await;
            info!(inputs = ids.len(), "compaction archived empty inputs");
            return Ok(());
        }

        // Compacted ids live in their own namespace, allocated past the
        // highest input id.
        let new_id = *ids.last().expect("non-empty input set") + 1;
        let tmp_path = self.tmp_dir().join(format!("compact_{new_id:012}.seg"));

        let written = match self.write_merged(&tmp_path, &merged).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                self.rollback_to_sealed(ids).await;
                return Err(e);
            }
        };

        let final_path = self.segment_dir.join(cmp_filename(new_id));
        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            self.rollback_to_sealed(ids).await;
            return Err(Error::io(&final_path, e));
        }

        let new_segment = NewCompactedSegment {
            segment_id: new_id,
            filename: final_path.to_string_lossy().into_owned(),
            size_bytes: written.size_bytes,
            record_count: merged.len() as u64,
            min_lsn: written.min_lsn,
            max_lsn: written.max_lsn,
            checksum: written.checksum,
        };
        if let Err(e) = self
            .manifest
            .commit_compaction_swap(&ids, new_segment)
            .await
        {
            let _ = tokio::fs::remove_file(&final_path).await;
            self.rollback_to_sealed(ids).await;
            return Err(e.into());
        }

        self.unlink_inputs(&segments).await;
        info!(
            inputs = ids.len(),
            cmp_segment_id = new_id,
            records = merged.len(),
            size_bytes = written.size_bytes,
            "compaction complete"
        );
        Ok(())
    }

    /// Fold the input segments down to the highest-LSN record per
    /// document. Live writes and tombstones are tracked in disjoint maps;
    /// a newer DELETE evicts the write and vice versa. Both kinds are
    /// emitted.
    async fn merge_records(&self, segments: &[SegmentInfo]) -> Result<Vec<Record>> {
        let mut latest_write: HashMap<String, Record> = HashMap::new();
        let mut latest_tombstone: HashMap<String, Record> = HashMap::new();
        let mut record_lsn: HashMap<String, u64> = HashMap::new();

        for seg in segments {
            let path = PathBuf::from(&seg.filename);
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

            let mut iter = SegmentIterator::open(&path).await?;
            while let Some(record) = iter.next().await? {
                let doc_id = match record.record_type {
                    RecordType::Insert | RecordType::Update => {
                        decode_doc_payload(&record.payload)?.0
                    }
                    RecordType::Delete => decode_delete_payload(&record.payload)?,
                    RecordType::Checkpoint | RecordType::Unknown(_) => continue,
                };

                let newer = record_lsn
                    .get(&doc_id)
                    .is_none_or(|seen| record.lsn > *seen);
                if !newer {
                    continue;
                }
                record_lsn.insert(doc_id.clone(), record.lsn);
                if record.record_type == RecordType::Delete {
                    latest_write.remove(&doc_id);
                    latest_tombstone.insert(doc_id, record);
                } else {
                    latest_tombstone.remove(&doc_id);
                    latest_write.insert(doc_id, record);
                }
            }
        }

        let mut records: Vec<Record> = latest_write
            .into_values()
            .chain(latest_tombstone.into_values())
            .collect();
        records.sort_by_key(|r| r.lsn);
        Ok(records)
    }

    async fn write_merged(&self, tmp_path: &Path, records: &[Record]) -> Result<WrittenSegment> {
        if let Some(parent) = tmp_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }
        let mut writer = SegmentWriter::create(tmp_path).await?;
        let mut min_lsn = u64::MAX;
        let mut max_lsn = 0;
        for record in records {
            writer.write(record).await?;
            min_lsn = min_lsn.min(record.lsn);
            max_lsn = max_lsn.max(record.lsn);
        }
        let checksum = writer.finalize().await?;
        let size_bytes = writer.offset();
        writer.close().await?;
        Ok(WrittenSegment {
            size_bytes,
            min_lsn,
            max_lsn,
            checksum,
        })
    }

    async fn unlink_inputs(&self, segments: &[SegmentInfo]) {
        for seg in segments {
            if let Err(e) = tokio::fs::remove_file(&seg.filename).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(file = %seg.filename, error = %e, "failed to unlink archived segment");
                }
            }
        }
    }

    /// Roll `compacting` inputs back to `sealed`. Runs detached with a
    /// bounded timeout; awaited normally, but the work survives if the
    /// awaiting caller is cancelled.
    async fn rollback_to_sealed(&self, ids: Vec<u64>) {
        if ids.is_empty() {
            return;
        }
        let manifest = Arc::clone(&self.manifest);
        let handle = tokio::spawn(async move {
            let rollback = async {
                for id in &ids {
                    if let Err(e) = manifest.set_wal_status(*id, SegmentStatus::Sealed).await {
                        warn!(segment_id = id, error = %e, "failed to roll segment back to sealed");
                    }
                }
            };
            if tokio::time::timeout(ROLLBACK_TIMEOUT, rollback).await.is_err() {
                warn!("compaction rollback timed out");
            }
        });
        let _ = handle.await;
    }
}

struct WrittenSegment {
    size_bytes: u64,
    min_lsn: u64,
    max_lsn: u64,
    checksum: String,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use vectorhouse_core::record::{
        encode_checkpoint_payload, encode_delete_payload, encode_doc_payload,
    };
    use vectorhouse_core::{DocMetadata, Embedding};
    use vectorhouse_metadata::{ManifestStore as _, MemoryManifestStore, SegmentKind};

    use super::*;
    use crate::segment::reader::read_all_records;
    use crate::segment::wal_filename;

    fn doc_record(lsn: u64, doc_id: &str, title: &str) -> Record {
        let meta = DocMetadata {
            source: "test".into(),
            title: title.into(),
            text: String::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
        };
        let payload =
            encode_doc_payload(doc_id, &meta, &Embedding::deterministic(doc_id)).unwrap();
        Record::new(RecordType::Insert, lsn, payload).unwrap()
    }

    fn delete_record(lsn: u64, doc_id: &str) -> Record {
        Record::new(RecordType::Delete, lsn, encode_delete_payload(doc_id).unwrap()).unwrap()
    }

    async fn seed_sealed_segment(
        manifest: &MemoryManifestStore,
        dir: &Path,
        id: u64,
        records: &[Record],
    ) {
        let path = dir.join(wal_filename(id));
        let mut writer = SegmentWriter::create(&path).await.unwrap();
        for rec in records {
            writer.write(rec).await.unwrap();
        }
        let checksum = writer.finalize().await.unwrap();
        manifest
            .create_wal(id, &path.to_string_lossy())
            .await
            .unwrap();
        manifest.seal_wal(id, &checksum).await.unwrap();
    }

    fn compactor(manifest: Arc<MemoryManifestStore>, dir: &Path) -> Arc<Compactor> {
        Arc::new(Compactor::new(
            manifest as Arc<dyn ManifestStore>,
            dir,
            CompactionConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_merge_keeps_latest_and_preserves_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Arc::new(MemoryManifestStore::new());
        seed_sealed_segment(
            &manifest,
            dir.path(),
            1,
            &[doc_record(1, "a", "v1"), doc_record(2, "b", "B")],
        )
        .await;
        seed_sealed_segment(
            &manifest,
            dir.path(),
            2,
            &[doc_record(3, "a", "v2"), delete_record(4, "b")],
        )
        .await;

        let c = compactor(manifest.clone(), dir.path());
        c.force_compact().await.unwrap();

        // Inputs archived, output registered with the merged stats.
        assert!(manifest.list_sealed_wal().await.unwrap().is_empty());
        let archived = manifest
            .list_by_status(SegmentStatus::Archived)
            .await
            .unwrap();
        assert_eq!(archived.len(), 2);
        let sealed = manifest.list_by_status(SegmentStatus::Sealed).await.unwrap();
        assert_eq!(sealed.len(), 1);
        let cmp = &sealed[0];
        assert_eq!(cmp.kind, SegmentKind::Cmp);
        assert_eq!(cmp.segment_id, 3);
        assert_eq!(cmp.record_count, 2);
        assert_eq!(cmp.min_lsn, Some(3));
        assert_eq!(cmp.max_lsn, Some(4));

        // Input files are gone; the output holds the latest write for
        // "a" and the tombstone for "b", in LSN order.
        assert!(!dir.path().join(wal_filename(1)).exists());
        assert!(!dir.path().join(wal_filename(2)).exists());
        let out = PathBuf::from(&cmp.filename);
        let records = read_all_records(&out).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lsn, 3);
        assert_eq!(records[0].record_type, RecordType::Insert);
        assert_eq!(records[1].lsn, 4);
        assert_eq!(records[1].record_type, RecordType::Delete);
    }

    #[tokio::test]
    async fn test_timed_run_respects_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Arc::new(MemoryManifestStore::new());
        seed_sealed_segment(&manifest, dir.path(), 1, &[doc_record(1, "a", "A")]).await;

        let c = compactor(manifest.clone(), dir.path());
        c.compact().await.unwrap();

        // One sealed segment is below the threshold: untouched.
        assert_eq!(manifest.list_sealed_wal().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_force_needs_two_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Arc::new(MemoryManifestStore::new());
        seed_sealed_segment(&manifest, dir.path(), 1, &[doc_record(1, "a", "A")]).await;

        let c = compactor(manifest.clone(), dir.path());
        c.force_compact().await.unwrap();
        assert_eq!(manifest.list_sealed_wal().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_only_inputs_are_archived_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Arc::new(MemoryManifestStore::new());
        let ckpt1 =
            Record::new(RecordType::Checkpoint, 1, encode_checkpoint_payload(0)).unwrap();
        let ckpt2 =
            Record::new(RecordType::Checkpoint, 2, encode_checkpoint_payload(1)).unwrap();
        seed_sealed_segment(&manifest, dir.path(), 1, &[ckpt1]).await;
        seed_sealed_segment(&manifest, dir.path(), 2, &[ckpt2]).await;

        let c = compactor(manifest.clone(), dir.path());
        c.force_compact().await.unwrap();

        assert_eq!(
            manifest
                .list_by_status(SegmentStatus::Archived)
                .await
                .unwrap()
                .len(),
            2
        );
        // No compacted segment was produced.
        assert!(manifest
            .list_by_status(SegmentStatus::Sealed)
            .await
            .unwrap()
            .is_empty());
        assert!(!dir.path().join(wal_filename(1)).exists());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Arc::new(MemoryManifestStore::new());
        seed_sealed_segment(&manifest, dir.path(), 1, &[doc_record(1, "a", "A")]).await;
        seed_sealed_segment(&manifest, dir.path(), 2, &[doc_record(2, "b", "B")]).await;

        // Flip a byte in segment 1 behind the catalog's back.
        let path = dir.path().join(wal_filename(1));
        let mut data = tokio::fs::read(&path).await.unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xff;
        tokio::fs::write(&path, &data).await.unwrap();

        let c = compactor(manifest.clone(), dir.path());
        let err = c.force_compact().await.unwrap_err();
        assert!(matches!(err, Error::SealedSegmentChecksumMismatch { .. }));

        // Both inputs rolled back to sealed; nothing archived.
        assert_eq!(manifest.list_sealed_wal().await.unwrap().len(), 2);
        assert!(manifest
            .list_by_status(SegmentStatus::Archived)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Arc::new(MemoryManifestStore::new());
        let c = compactor(manifest, dir.path());

        let _guard = c.run_lock.try_lock().unwrap();
        let err = c.force_compact().await.unwrap_err();
        assert!(matches!(err, Error::CompactionAlreadyRunning));
    }
}
