//! Store Facade
//!
//! `WalStore` binds the WAL writer, the manifest, the in-memory index,
//! recovery and the compactor behind one durable document-store API:
//! `add` / `delete` / `get` / `search` / `count` / `flush` / `close` /
//! `checkpoint` / `force_compact`.
//!
//! ## Open Sequence
//!
//! 1. File-driven recovery replays every segment on disk into the index -
//!    the files are authoritative for document state
//! 2. The manifest's persisted state is consulted, and the writer resumes
//!    at `max(state.next_lsn, recovered_max_lsn + 1)` and
//!    `max(state.current_segment_id, latest wal file id)` so neither the
//!    LSN clock nor the segment allocator can rewind. Compacted segment
//!    ids never participate in that maximum
//! 3. The initial segment is registered in the manifest (already-present
//!    is fine) and the state is written back
//!
//! ## Locking
//!
//! Mutations (`add`, `delete`, `checkpoint`, `flush`, `close`) hold the
//! facade mutex: the INSERT-vs-UPDATE decision, the WAL append and the
//! index update form one atomic step. Reads (`get`, `search`, `count`) go
//! straight to the index, which has its own readers/writer lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};
use vectorhouse_core::record::{
    encode_checkpoint_payload, encode_delete_payload, encode_doc_payload,
};
use vectorhouse_core::{DocMetadata, Document, Embedding, RecordType};
use vectorhouse_metadata::{ManifestError, ManifestStore, MemoryManifestStore};

use crate::compactor::Compactor;
use crate::config::{ManifestConfig, StoreConfig, SyncPolicy};
use crate::error::{Error, Result};
use crate::index::{MemIndex, SearchResult};
use crate::recovery::{RecoveryManager, RecoveryStats};
use crate::segment::{find_latest_wal_segment, wal_filename};
use crate::writer::{WalWriter, WalWriterConfig};

const CLOSE_STATE_TIMEOUT: Duration = Duration::from_secs(5);

struct StoreState {
    closed: bool,
}

/// Durable, crash-recoverable document store with vector search.
pub struct WalStore {
    wal_dir: PathBuf,
    sync_policy: SyncPolicy,
    index: Arc<MemIndex>,
    writer: Arc<WalWriter>,
    manifest: Arc<dyn ManifestStore>,
    compactor: Option<Arc<Compactor>>,
    recovery_stats: RecoveryStats,
    state: Mutex<StoreState>,
}

impl WalStore {
    /// Recover whatever is on disk and open the store for writes.
    pub async fn open(config: StoreConfig) -> Result<WalStore> {
        let wal_dir = config.resolved_wal_dir();
        tokio::fs::create_dir_all(&wal_dir)
            .await
            .map_err(|e| Error::io(&wal_dir, e))?;

        let manifest: Arc<dyn ManifestStore> = match &config.manifest {
            ManifestConfig::InMemory => Arc::new(MemoryManifestStore::new()),
            ManifestConfig::Transactional(handle) => Arc::clone(handle),
        };

        let index = Arc::new(MemIndex::new());
        let recovery = RecoveryManager::new(
            Arc::clone(&manifest),
            wal_dir.clone(),
            Arc::clone(&index),
        );
        let recovery_stats = recovery.recover_without_manifest().await?;

        // Resume points: never rewind the LSN clock or the segment
        // allocator, whichever source of truth is further ahead.
        let state = manifest.wal_state().await?;
        let mut initial_lsn = state.next_lsn.max(1);
        if recovery_stats.max_lsn >= initial_lsn {
            initial_lsn = recovery_stats.max_lsn + 1;
        }
        let mut initial_segment_id = state.current_segment_id.max(1);
        if let Some((_, latest_wal_id)) = find_latest_wal_segment(&wal_dir).await? {
            initial_segment_id = initial_segment_id.max(latest_wal_id);
        }

        let writer = WalWriter::open(
            wal_dir.clone(),
            Some(Arc::clone(&manifest)),
            WalWriterConfig {
                sync_policy: config.sync_policy,
                max_segment_size: config.max_segment_size,
                max_segment_age: config.max_segment_age,
                initial_lsn,
                initial_segment_id,
            },
        )
        .await?;

        let segment_path = wal_dir.join(wal_filename(initial_segment_id));
        match manifest
            .create_wal(initial_segment_id, &segment_path.to_string_lossy())
            .await
        {
            Ok(()) | Err(ManifestError::UniqueViolation { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        manifest.set_wal_state(initial_segment_id, initial_lsn).await?;

        let compactor = if config.enable_compaction {
            let compactor = Arc::new(Compactor::new(
                Arc::clone(&manifest),
                wal_dir.clone(),
                config.compaction.clone(),
            ));
            compactor.start().await?;
            Some(compactor)
        } else {
            None
        };

        info!(
            documents = index.count(),
            next_lsn = initial_lsn,
            segment_id = initial_segment_id,
            "wal store opened"
        );

        Ok(WalStore {
            wal_dir,
            sync_policy: config.sync_policy,
            index,
            writer,
            manifest,
            compactor,
            recovery_stats,
            state: Mutex::new(StoreState { closed: false }),
        })
    }

    /// Insert or update a document. The write is durable per the sync
    /// policy before the index is touched.
    pub async fn add(&self, doc: Document) -> Result<()> {
        let guard = self.state.lock().await;
        if guard.closed {
            return Err(Error::StoreClosed);
        }

        // Informational only: readers of the log can tell first writes
        // from overwrites, the index treats both as set.
        let record_type = if self.index.has(&doc.id) {
            RecordType::Update
        } else {
            RecordType::Insert
        };

        let meta = DocMetadata {
            source: doc.source.clone(),
            title: doc.title.clone(),
            text: doc.text.clone(),
            metadata: doc.metadata.clone(),
            created_at: doc.created_at,
        };
        let payload = encode_doc_payload(&doc.id, &meta, &doc.embedding)?;

        if self.sync_policy.is_immediate() {
            self.writer.append_sync(record_type, payload).await?;
        } else {
            self.writer.append(record_type, payload).await?;
        }
        self.index.set(doc);
        Ok(())
    }

    /// Write a tombstone and drop the document from the index.
    pub async fn delete(&self, doc_id: &str) -> Result<()> {
        let guard = self.state.lock().await;
        if guard.closed {
            return Err(Error::StoreClosed);
        }

        let payload = encode_delete_payload(doc_id)?;
        if self.sync_policy.is_immediate() {
            self.writer.append_sync(RecordType::Delete, payload).await?;
        } else {
            self.writer.append(RecordType::Delete, payload).await?;
        }
        self.index.delete(doc_id);
        Ok(())
    }

    pub fn get(&self, doc_id: &str) -> Option<Document> {
        self.index.get(doc_id)
    }

    /// Brute-force similarity search. `limit == 0` returns everything.
    pub fn search(&self, query: &Embedding, limit: usize) -> Vec<SearchResult> {
        self.index.search(query, limit)
    }

    pub fn count(&self) -> usize {
        self.index.count()
    }

    /// Push pending writes to disk. No-op under immediate sync.
    pub async fn flush(&self) -> Result<()> {
        let guard = self.state.lock().await;
        if guard.closed {
            return Err(Error::StoreClosed);
        }
        if self.sync_policy.is_immediate() {
            return Ok(());
        }
        self.writer.sync().await
    }

    /// Append a CHECKPOINT record, synced regardless of policy.
    pub async fn checkpoint(&self) -> Result<()> {
        let guard = self.state.lock().await;
        if guard.closed {
            return Err(Error::StoreClosed);
        }
        let payload = encode_checkpoint_payload(self.writer.current_lsn());
        self.writer
            .append_sync(RecordType::Checkpoint, payload)
            .await?;
        Ok(())
    }

    /// Stop background work, flush and close the writer, and persist the
    /// final WAL state. The first error is reported; later steps still
    /// run. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        if guard.closed {
            return Ok(());
        }
        guard.closed = true;

        let mut first_error: Option<Error> = None;

        if let Some(compactor) = &self.compactor {
            compactor.stop().await;
        }

        if let Err(e) = self.writer.close().await {
            warn!(error = %e, "failed to close wal writer");
            first_error.get_or_insert(e);
        }

        let segment_id = self.writer.current_segment_id().await;
        let next_lsn = self.writer.current_lsn();
        match tokio::time::timeout(
            CLOSE_STATE_TIMEOUT,
            self.manifest.set_wal_state(segment_id, next_lsn),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "failed to persist wal state on close");
                first_error.get_or_insert(e.into());
            }
            Err(_) => warn!("timed out persisting wal state on close"),
        }

        info!(segment_id, next_lsn, "wal store closed");
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Run a compaction now. Errors with `CompactionDisabled` when the
    /// store was opened without compaction.
    pub async fn force_compact(&self) -> Result<()> {
        match &self.compactor {
            Some(compactor) => compactor.force_compact().await,
            None => Err(Error::CompactionDisabled),
        }
    }

    /// Stats from the recovery pass that ran at open.
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery_stats
    }

    /// Direct access to the in-memory index.
    pub fn index(&self) -> &MemIndex {
        &self.index
    }

    pub fn wal_dir(&self) -> &std::path::Path {
        &self.wal_dir
    }
}
