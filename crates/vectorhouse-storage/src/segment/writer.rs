//! Segment Writer
//!
//! Appends encoded records to a segment file while keeping a rolling IEEE
//! CRC32 over every byte written. `finalize()` flushes the file and
//! returns the checksum as lowercase zero-padded hex; the same value is
//! stamped into the manifest when a segment is sealed, so a sealed file
//! can later be verified byte-for-byte against the catalog.
//!
//! Not thread-safe: each writer is owned by a single task (the compactor,
//! or a test building fixtures). The live WAL append path has its own
//! locking in [`crate::writer::WalWriter`].

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use vectorhouse_core::Record;

use crate::error::{Error, Result};

pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    offset: u64,
    hasher: crc32fast::Hasher,
}

impl SegmentWriter {
    /// Create (or truncate) a segment file.
    pub async fn create(path: impl Into<PathBuf>) -> Result<SegmentWriter> {
        let path = path.into();
        let file = File::create(&path)
            .await
            .map_err(|e| Error::io(&path, e))?;
        Ok(SegmentWriter {
            file,
            path,
            offset: 0,
            hasher: crc32fast::Hasher::new(),
        })
    }

    /// Append one encoded record.
    pub async fn write(&mut self, record: &Record) -> Result<()> {
        let data = record.encode();
        self.file
            .write_all(&data)
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        self.hasher.update(&data);
        self.offset += data.len() as u64;
        Ok(())
    }

    /// Flush to durable storage and return the rolling checksum as
    /// lowercase 8-char hex.
    pub async fn finalize(&mut self) -> Result<String> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(format!("{:08x}", self.hasher.clone().finalize()))
    }

    /// Close the descriptor without re-flushing.
    pub async fn close(self) -> Result<()> {
        drop(self.file);
        Ok(())
    }

    /// Bytes written so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
