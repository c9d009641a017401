//! WAL Writer
//!
//! The serialized append path of the store. One mutex guards the open
//! file, the current segment id and the byte offset; LSN assignment, the
//! file append, the optional fsync and rotation all happen inside that
//! critical section, which is what makes LSN order and file order the
//! same thing.
//!
//! ## Durability
//!
//! Under `SyncPolicy::Immediate` every append fsyncs before returning.
//! Under `SyncPolicy::Batched` a background task flushes on a timer and
//! the append path flushes whenever `batch_size` writes are pending; a
//! crash can lose at most that window, never produce a torn record.
//!
//! ## Open-Time Tail Repair
//!
//! On open, an existing segment is scanned with the same validator the
//! iterator uses. A file extending past its last fully valid record is
//! the signature of a crash mid-append, and the tail is truncated before
//! any new byte is written.
//!
//! ## Rotation
//!
//! When the post-append offset reaches `max_segment_size` (or the segment
//! outlives `max_segment_age`), the writer flushes, computes the
//! whole-file checksum, seals the segment in the manifest (folding in its
//! size/count/LSN-range stats), registers the successor and switches
//! files. A rotation failure fails the append that triggered it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use vectorhouse_core::{Record, RecordType};
use vectorhouse_metadata::{ManifestError, ManifestStore};

use crate::config::SyncPolicy;
use crate::error::{Error, Result};
use crate::segment::reader::{segment_checksum, segment_stats, SegmentIterator};
use crate::segment::{should_rotate, wal_filename, DEFAULT_MAX_SEGMENT_SIZE};

/// Writer start-up parameters. The store facade fills `initial_lsn` and
/// `initial_segment_id` from recovery so the allocator never rewinds.
#[derive(Debug, Clone)]
pub struct WalWriterConfig {
    pub sync_policy: SyncPolicy,
    pub max_segment_size: u64,
    pub max_segment_age: Option<Duration>,
    pub initial_lsn: u64,
    pub initial_segment_id: u64,
}

impl Default for WalWriterConfig {
    fn default() -> Self {
        Self {
            sync_policy: SyncPolicy::Immediate,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_segment_age: None,
            initial_lsn: 1,
            initial_segment_id: 1,
        }
    }
}

struct Inner {
    file: File,
    segment_id: u64,
    offset: u64,
    opened_at: Instant,
    pending_writes: usize,
    closed: bool,
}

/// Thread-safe write-ahead-log writer for one directory.
pub struct WalWriter {
    dir: PathBuf,
    sync_policy: SyncPolicy,
    max_segment_size: u64,
    max_segment_age: Option<Duration>,
    manifest: Option<Arc<dyn ManifestStore>>,
    next_lsn: AtomicU64,
    inner: Mutex<Inner>,
    shutdown_tx: watch::Sender<bool>,
    flush_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WalWriter {
    /// Open the writer on `dir`, creating the directory and the initial
    /// segment as needed and repairing any corrupt tail.
    pub async fn open(
        dir: impl Into<PathBuf>,
        manifest: Option<Arc<dyn ManifestStore>>,
        config: WalWriterConfig,
    ) -> Result<Arc<WalWriter>> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::io(&dir, e))?;

        let path = dir.join(wal_filename(config.initial_segment_id));
        let (file, offset) = open_segment(&path).await?;

        info!(
            dir = %dir.display(),
            segment_id = config.initial_segment_id,
            offset,
            next_lsn = config.initial_lsn,
            "wal writer opened"
        );

        let (shutdown_tx, _) = watch::channel(false);
        let writer = Arc::new(WalWriter {
            dir,
            sync_policy: config.sync_policy,
            max_segment_size: config.max_segment_size,
            max_segment_age: config.max_segment_age,
            manifest,
            next_lsn: AtomicU64::new(config.initial_lsn),
            inner: Mutex::new(Inner {
                file,
                segment_id: config.initial_segment_id,
                offset,
                opened_at: Instant::now(),
                pending_writes: 0,
                closed: false,
            }),
            shutdown_tx,
            flush_task: std::sync::Mutex::new(None),
        });

        if let SyncPolicy::Batched { interval, .. } = config.sync_policy {
            if !interval.is_zero() {
                writer.spawn_flush_task(interval);
            }
        }

        Ok(writer)
    }

    /// Append a record, syncing per the configured policy. Returns the
    /// assigned LSN.
    pub async fn append(&self, record_type: RecordType, payload: Bytes) -> Result<u64> {
        self.append_inner(record_type, payload, false).await
    }

    /// Append a record and fsync before returning, regardless of policy.
    pub async fn append_sync(&self, record_type: RecordType, payload: Bytes) -> Result<u64> {
        self.append_inner(record_type, payload, true).await
    }

    async fn append_inner(
        &self,
        record_type: RecordType,
        payload: Bytes,
        force_sync: bool,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Error::StoreClosed);
        }

        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let record = Record::new(record_type, lsn, payload)?;
        let data = record.encode();

        let path = self.segment_path(inner.segment_id);
        inner
            .file
            .write_all(&data)
            .await
            .map_err(|e| Error::io(&path, e))?;
        inner.offset += data.len() as u64;
        inner.pending_writes += 1;

        let sync_now = force_sync
            || match self.sync_policy {
                SyncPolicy::Immediate => true,
                SyncPolicy::Batched { batch_size, .. } => {
                    batch_size > 0 && inner.pending_writes >= batch_size
                }
            };
        if sync_now {
            self.sync_locked(&mut inner).await?;
        }

        if should_rotate(
            inner.offset,
            inner.opened_at.elapsed(),
            self.max_segment_size,
            self.max_segment_age,
        ) {
            self.rotate_locked(&mut inner).await?;
        }

        Ok(lsn)
    }

    /// Flush pending writes to durable storage. Idempotent.
    pub async fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        self.sync_locked(&mut inner).await
    }

    async fn sync_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.pending_writes == 0 {
            return Ok(());
        }
        let path = self.segment_path(inner.segment_id);
        inner.file.flush().await.map_err(|e| Error::io(&path, e))?;
        inner
            .file
            .sync_all()
            .await
            .map_err(|e| Error::io(&path, e))?;
        inner.pending_writes = 0;
        Ok(())
    }

    async fn rotate_locked(&self, inner: &mut Inner) -> Result<()> {
        self.sync_locked(inner).await?;

        let old_id = inner.segment_id;
        let old_path = self.segment_path(old_id);
        let old_size = inner.offset;

        if let Some(manifest) = &self.manifest {
            let checksum = segment_checksum(&old_path).await?;
            manifest.seal_wal(old_id, &checksum).await?;
            let stats = segment_stats(&old_path).await?;
            manifest
                .update_wal_stats(old_id, old_size, stats.record_count, stats.min_lsn, stats.max_lsn)
                .await?;
        }

        let new_id = old_id + 1;
        let new_path = self.segment_path(new_id);
        if let Some(manifest) = &self.manifest {
            // A crash between registration and first write can leave the
            // successor already cataloged; that registration still holds.
            match manifest.create_wal(new_id, &new_path.to_string_lossy()).await {
                Ok(()) | Err(ManifestError::UniqueViolation { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let (file, offset) = open_segment(&new_path).await?;
        info!(sealed = old_id, active = new_id, size = old_size, "rotated wal segment");

        // Replacing the handle closes the sealed file.
        inner.file = file;
        inner.segment_id = new_id;
        inner.offset = offset;
        inner.opened_at = Instant::now();
        inner.pending_writes = 0;
        Ok(())
    }

    /// Flush, stop the background task and close the file. Safe to call
    /// more than once.
    pub async fn close(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
        }

        let _ = self.shutdown_tx.send(true);
        let task = self.flush_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let mut inner = self.inner.lock().await;
        let path = self.segment_path(inner.segment_id);
        inner.file.flush().await.map_err(|e| Error::io(&path, e))?;
        inner
            .file
            .sync_all()
            .await
            .map_err(|e| Error::io(&path, e))?;
        debug!(segment_id = inner.segment_id, "wal writer closed");
        Ok(())
    }

    /// The next LSN that will be assigned.
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst)
    }

    pub async fn current_segment_id(&self) -> u64 {
        self.inner.lock().await.segment_id
    }

    pub async fn current_offset(&self) -> u64 {
        self.inner.lock().await.offset
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn segment_path(&self, segment_id: u64) -> PathBuf {
        self.dir.join(wal_filename(segment_id))
    }

    fn spawn_flush_task(self: &Arc<Self>, interval: Duration) {
        let writer = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let mut inner = writer.inner.lock().await;
                        if inner.closed {
                            break;
                        }
                        if inner.pending_writes > 0 {
                            if let Err(e) = writer.sync_locked(&mut inner).await {
                                warn!(error = %e, "background wal sync failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *self.flush_task.lock().unwrap() = Some(handle);
    }
}

/// Open a segment file for appending, truncating any corrupt tail left by
/// a crash.
async fn open_segment(path: &Path) -> Result<(File, u64)> {
    if let Ok(meta) = tokio::fs::metadata(path).await {
        if meta.len() > 0 {
            let valid = find_last_valid_offset(path).await?;
            if valid < meta.len() {
                warn!(
                    path = %path.display(),
                    file_len = meta.len(),
                    valid_offset = valid,
                    "truncating corrupt segment tail"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .await
                    .map_err(|e| Error::io(path, e))?;
                file.set_len(valid).await.map_err(|e| Error::io(path, e))?;
                file.sync_all().await.map_err(|e| Error::io(path, e))?;
            }
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| Error::io(path, e))?;
    let offset = file.metadata().await.map_err(|e| Error::io(path, e))?.len();
    Ok((file, offset))
}

/// Scan a segment with the iterator's validator and return the offset
/// just past the last fully valid record. Validation failures mark the
/// end of the good prefix; they are not errors here.
async fn find_last_valid_offset(path: &Path) -> Result<u64> {
    let mut iter = SegmentIterator::open(path).await?;
    loop {
        match iter.next().await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => break,
        }
    }
    Ok(iter.valid_offset())
}
